//! BTS tracer.
//!
//! Forks the SUT, attaches a `perf_event_open` counter of type `intel_bts`,
//! maps its ring + AUX region, feeds the input on the SUT's stdin, waits for
//! termination and hands back the raw branch records found in the AUX area.
//!
//! This is the only module that talks directly to the kernel's `perf_event`
//! ABI; the `perf_event_attr`/`perf_event_mmap_page` layouts below are
//! hand-written FFI structs rather than bindgen output, since only a
//! handful of fields are ever touched.

use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;

use crate::error::MonitorError;
use crate::log::{self, Level};

/// One `(from, to, misc)` branch record, as laid out contiguously in the AUX
/// region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchRecord {
    pub from: u64,
    pub to: u64,
    pub misc: u64,
}

/// Either endpoint above this is treated as kernel noise and discarded.
const NOISE_CUTOFF: u64 = 0xFFFF_FFFF_0000_0000;

impl BranchRecord {
    fn is_noise(&self) -> bool {
        self.from > NOISE_CUTOFF || self.to > NOISE_CUTOFF
    }
}

const PERF_MAP_SZ: usize = 1024 * 512;
const PERF_AUX_SZ: usize = 1024 * 1024;

// linux/perf_event.h `struct perf_event_attr`, trimmed to the fields this
// tracer sets; `__reserved_*`-style padding is folded into `flags`/tail
// fields exactly as the kernel expects them zeroed.
#[repr(C)]
#[derive(Default)]
struct PerfEventAttr {
    type_: u32,
    size: u32,
    config: u64,
    sample_period_or_freq: u64,
    sample_type: u64,
    read_format: u64,
    flags: u64,
    wakeup_events_or_watermark: u32,
    bp_type: u32,
    config1_or_bp_addr: u64,
    config2_or_bp_len: u64,
    branch_sample_type: u64,
    sample_regs_user: u64,
    sample_stack_user: u32,
    clockid: i32,
    sample_regs_intr: u64,
    aux_watermark: u32,
    sample_max_stack: u16,
    __reserved_2: u16,
    aux_sample_size: u32,
    __reserved_3: u32,
    sig_data: u64,
    config3: u64,
}

/// Bit position of `exclude_kernel` in `perf_event_attr.flags`
/// (`disabled, inherit, pinned, exclusive, exclude_user, exclude_kernel, ...`).
const FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;

// linux/perf_event.h `struct perf_event_mmap_page`.
#[repr(C)]
struct PerfEventMmapPage {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    __reserved: [u8; 116 * 8],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
    aux_head: u64,
    aux_tail: u64,
    aux_offset: u64,
    aux_size: u64,
}

unsafe fn perf_event_open(
    attr: &PerfEventAttr,
    pid: libc::pid_t,
    cpu: i32,
    group_fd: i32,
    flags: u64,
) -> io::Result<i32> {
    let fd = libc::syscall(
        libc::SYS_perf_event_open,
        attr as *const PerfEventAttr,
        pid,
        cpu,
        group_fd,
        flags,
    );
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd as i32)
    }
}

/// Reads the kernel-exported integer type id of the `intel_bts` PMU.
/// Initialisation-time failure here is fatal: the host can't trace at all.
fn read_bts_type() -> Result<u32, MonitorError> {
    let raw = std::fs::read_to_string("/sys/bus/event_source/devices/intel_bts/type")
        .map_err(|e| MonitorError::PlatformUnsupported(format!("intel_bts not supported: {e}")))?;
    raw.trim()
        .parse()
        .map_err(|_| MonitorError::PlatformUnsupported(format!("malformed intel_bts type: {raw:?}")))
}

/// Owns the BTS type id probed once at startup.
pub struct Tracer {
    bts_type: u32,
}

impl Tracer {
    pub fn new() -> Result<Self, MonitorError> {
        let bts_type = read_bts_type()?;
        log::log(Level::Debug, &format!("perf_bts_type = {bts_type}"));
        Ok(Self { bts_type })
    }

    /// Runs one trace: fork the SUT, feed it `input` on stdin, wait for it to
    /// finish, and return the branch records recorded in the AUX region.
    ///
    /// Ordering: pipe, fork, child redirects stdin/execs, parent opens the
    /// perf counter and maps ring+AUX, enables the counter, writes the input
    /// and closes the pipe, waits for the child, then reads `aux_head`.
    pub fn trace(&self, input: &[u8], argv: &[String]) -> Result<Vec<BranchRecord>, MonitorError> {
        let (read_fd, write_fd) = make_pipe()?;

        // SAFETY: fork() is async-signal-safe up to the point the child
        // either execs or _exit()s; no allocations happen in the child path
        // below apart from CString::new, which happens before the fork.
        let argv_c: Vec<CString> = argv
            .iter()
            .map(|s| CString::new(s.as_str()).expect("argv must not contain NUL bytes"))
            .collect();
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv_c.iter().map(|s| s.as_ptr()).chain(std::iter::once(ptr::null())).collect();

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(MonitorError::Trace(format!("fork failed: {}", io::Error::last_os_error())));
        }

        if pid == 0 {
            unsafe {
                libc::close(write_fd);
                libc::dup2(read_fd, libc::STDIN_FILENO);
                libc::close(read_fd);

                let null_fd = libc::open(b"/dev/null\0".as_ptr() as *const _, libc::O_WRONLY);
                if null_fd >= 0 {
                    libc::dup2(null_fd, libc::STDOUT_FILENO);
                    libc::dup2(null_fd, libc::STDERR_FILENO);
                    libc::close(null_fd);
                }

                libc::execv(argv_ptrs[0], argv_ptrs.as_mut_ptr());
                libc::_exit(127);
            }
        }

        // Parent.
        unsafe { libc::close(read_fd) };
        match self.trace_parent(pid, write_fd, input) {
            Ok(records) => Ok(records),
            Err(e) => {
                unsafe { libc::kill(pid, libc::SIGKILL) };
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
                Err(e)
            }
        }
    }

    fn trace_parent(
        &self,
        child_pid: libc::pid_t,
        write_fd: i32,
        input: &[u8],
    ) -> Result<Vec<BranchRecord>, MonitorError> {
        let mut attr = PerfEventAttr {
            size: mem::size_of::<PerfEventAttr>() as u32,
            type_: self.bts_type,
            flags: FLAG_EXCLUDE_KERNEL,
            ..Default::default()
        };

        let perf_fd = unsafe {
            perf_event_open(&mut attr, child_pid, -1, -1, libc::PERF_FLAG_FD_CLOEXEC as u64)
        }
        .map_err(|e| MonitorError::Trace(format!("perf_event_open failed: {e}")))?;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let ring_len = PERF_MAP_SZ + page_size;

        let ring_guard = MmapGuard::new(ring_len, perf_fd, 0).map_err(|e| {
            unsafe { libc::close(perf_fd) };
            MonitorError::Trace(format!("failed to mmap perf ring buffer: {e}"))
        })?;

        // SAFETY: `ring_guard` maps exactly `ring_len` bytes starting with
        // the metadata page the kernel writes `perf_event_mmap_page` into.
        let pem = unsafe { &mut *(ring_guard.ptr as *mut PerfEventMmapPage) };
        pem.aux_offset = pem.data_offset + pem.data_size;
        pem.aux_size = PERF_AUX_SZ as u64;

        let aux_guard = MmapGuard::new_readonly(pem.aux_size as usize, perf_fd, pem.aux_offset as i64)
            .map_err(|e| {
                unsafe { libc::close(perf_fd) };
                MonitorError::Trace(format!("failed to mmap perf aux region: {e}"))
            })?;

        if unsafe { libc::ioctl(perf_fd, perf_event_ioc_enable()) } == -1 {
            unsafe { libc::close(perf_fd) };
            return Err(MonitorError::Trace(format!(
                "PERF_EVENT_IOC_ENABLE failed: {}",
                io::Error::last_os_error()
            )));
        }

        // Writing after exec-but-before-reap is safe: the child is already
        // blocked reading stdin, and small inputs fit in the pipe buffer so
        // this never blocks the parent either.
        write_all_and_close(write_fd, input)
            .map_err(|e| MonitorError::Trace(format!("failed writing input to SUT: {e}")))?;

        let mut status = 0;
        if unsafe { libc::waitpid(child_pid, &mut status, 0) } == -1 {
            unsafe { libc::close(perf_fd) };
            return Err(MonitorError::Trace(format!(
                "waitpid failed: {}",
                io::Error::last_os_error()
            )));
        }
        log::log(Level::Debug, &format!("PID={child_pid} finished with status {status}"));

        let aux_head = pem.aux_head as usize;
        let aux_slice = aux_guard.as_slice();
        let record_sz = mem::size_of::<BranchRecord>();
        let count = aux_head / record_sz;

        let mut records = Vec::with_capacity(count);
        for i in 0..count {
            let offset = i * record_sz;
            // SAFETY: `offset + record_sz <= aux_head <= aux_slice.len()`
            // and `BranchRecord` is `repr(C)` with no padding or niches.
            let record = unsafe { ptr::read_unaligned(aux_slice.as_ptr().add(offset) as *const BranchRecord) };
            if !record.is_noise() {
                records.push(record);
            }
        }

        unsafe { libc::close(perf_fd) };
        Ok(records)
    }
}

fn perf_event_ioc_enable() -> u64 {
    // _IO('$', 0) from linux/perf_event.h.
    const PERF_EVENT_IOC_MAGIC: u64 = b'$' as u64;
    PERF_EVENT_IOC_MAGIC << 8
}

fn make_pipe() -> Result<(i32, i32), MonitorError> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(MonitorError::Trace(format!("pipe failed: {}", io::Error::last_os_error())));
    }
    Ok((fds[0], fds[1]))
}

fn write_all_and_close(fd: i32, input: &[u8]) -> io::Result<()> {
    use std::os::fd::FromRawFd;
    use std::io::Write;

    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let result = file.write_all(input);
    drop(file); // closes fd
    result
}

/// RAII wrapper around one `mmap` region; unmaps in `Drop`.
struct MmapGuard {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapGuard {
    fn new(len: usize, fd: i32, offset: i64) -> io::Result<Self> {
        Self::map(len, fd, offset, libc::PROT_READ | libc::PROT_WRITE)
    }

    fn new_readonly(len: usize, fd: i32, offset: i64) -> io::Result<Self> {
        Self::map(len, fd, offset, libc::PROT_READ)
    }

    fn map(len: usize, fd: i32, offset: i64, prot: i32) -> io::Result<Self> {
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, offset) };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(Self { ptr, len })
        }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MmapGuard {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr, self.len) };
    }
}
