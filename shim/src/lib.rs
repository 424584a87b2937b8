//! SUT-side interposition shim.
//!
//! `LD_PRELOAD`ed into the SUT by the external fuzzer, never by the monitor
//! itself. Intercepts `open`/`open64`/`write`, identifies the fuzzer's
//! "current input" file by a substring match on its path, and forwards
//! every subsequent write on that descriptor to the monitor's `PULL`
//! socket. Hooking goes through `redhook` rather than hand-rolled `dlsym`
//! calls, since Rust doesn't have stable C-variadic `open(2, ...)` wrappers.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::os::raw::c_uint;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use redhook::{hook, real};

/// The substring matched against an opened path to identify the fuzzer's
/// current-input file; env-selectable, defaulting to the AFL convention.
fn resolve_needle(value: Option<String>) -> String {
    value.unwrap_or_else(|| "cur_input".to_string())
}

fn needle() -> &'static str {
    static NEEDLE: OnceLock<String> = OnceLock::new();
    NEEDLE.get_or_init(|| resolve_needle(std::env::var("BTSMON_SHIM_NEEDLE").ok()))
}

/// The fd last matched against `needle()`; `-1` means "none yet". A global
/// by necessity: interposed libc symbols have no home for per-process state
/// besides process-wide statics.
static FUZZER_FD: AtomicI32 = AtomicI32::new(-1);

struct PushSocket {
    _ctx: zmq::Context,
    socket: zmq::Socket,
}

// SAFETY: the SUT this shim is preloaded into is expected to be
// single-threaded from the monitor's point of view; a multithreaded SUT
// would race on this global.
unsafe impl Sync for PushSocket {}

static PUSH: OnceLock<PushSocket> = OnceLock::new();
static OWNER_PID: AtomicI32 = AtomicI32::new(0);

fn push_socket() -> Option<&'static zmq::Socket> {
    PUSH.get().map(|p| &p.socket)
}

fn matches_needle(path: *const c_char) -> bool {
    if path.is_null() {
        return false;
    }
    // SAFETY: libc guarantees `path` is a NUL-terminated C string for any
    // well-formed `open`/`open64` call; this function only inspects it.
    let c_str = unsafe { CStr::from_ptr(path) };
    c_str.to_str().map(|s| s.contains(needle())).unwrap_or(false)
}

hook! {
    unsafe fn open(path: *const c_char, flags: c_int, mode: c_uint) -> c_int => btsmon_shim_open {
        let ret = real!(open)(path, flags, mode);
        if ret >= 0 && matches_needle(path) {
            FUZZER_FD.store(ret, Ordering::Relaxed);
        }
        ret
    }
}

hook! {
    unsafe fn open64(path: *const c_char, flags: c_int, mode: c_uint) -> c_int => btsmon_shim_open64 {
        let ret = real!(open64)(path, flags, mode);
        if ret >= 0 && matches_needle(path) {
            FUZZER_FD.store(ret, Ordering::Relaxed);
        }
        ret
    }
}

hook! {
    unsafe fn write(fd: c_int, buf: *const c_void, count: usize) -> isize => btsmon_shim_write {
        if fd == FUZZER_FD.load(Ordering::Relaxed) {
            if let Some(socket) = push_socket() {
                // SAFETY: `buf`/`count` come straight from the intercepted
                // call and describe a valid readable region for its duration.
                let bytes = std::slice::from_raw_parts(buf as *const u8, count);
                let _ = socket.send(bytes, 0);
            }
        }
        real!(write)(fd, buf, count)
    }
}

#[ctor::ctor]
fn on_load() {
    OWNER_PID.store(std::process::id() as i32, Ordering::Relaxed);

    let ctx = zmq::Context::new();
    let socket = match ctx.socket(zmq::PUSH) {
        Ok(s) => s,
        Err(_) => return,
    };
    if socket.connect("tcp://localhost:5558").is_err() {
        return;
    }
    let _ = PUSH.set(PushSocket { _ctx: ctx, socket });

    // A forked child of the SUT shouldn't re-trigger this constructor in
    // its own exec.
    std::env::set_var("LD_PRELOAD", "");
}

#[ctor::dtor]
fn on_unload() {
    if OWNER_PID.load(Ordering::Relaxed) != std::process::id() as i32 {
        return;
    }
    if let Some(push) = PUSH.get() {
        push.socket.set_linger(0).ok();
    }
}
