//! ELF section locator.
//!
//! Resolves the virtual-address bounds of a named section (typically
//! `.text`) in the SUT binary, so the aggregator can drop branches that
//! land outside of it.

use crate::error::MonitorError;

use elfparser::{ELFMAGIC, ARCH64, LITTLEENDIAN, SHT_STRTAB};

/// Inclusive `[start, end]` bounds of one ELF section, plus its size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionBounds {
    pub start: u64,
    pub end: u64,
    pub size: u64,
}

/// Parse `path`'s ELF headers and return the bounds of the section named `name`.
///
/// Fails if the file can't be opened, isn't a valid ELF, or has no section
/// by that name. A present but zero-sized section is reported back to the
/// caller rather than treated as "not found" -- callers decide whether an
/// empty section is fatal.
pub fn find_section(path: &str, name: &str) -> Result<SectionBounds, MonitorError> {
    let target = std::fs::read(path)
        .map_err(|e| MonitorError::Elf(format!("failed to read {path}: {e}")))?;

    let elf_hdr = elfparser::Header::new(&target)
        .ok_or_else(|| MonitorError::Elf(format!("{path} is too small to be an ELF file")))?;

    if elf_hdr.magic != ELFMAGIC {
        return Err(MonitorError::Elf(format!("{path} is not an ELF file")));
    }
    if elf_hdr.bitsize != ARCH64 {
        return Err(MonitorError::Elf(format!("{path} is not a 64-bit ELF file")));
    }
    if elf_hdr.endian != LITTLEENDIAN {
        return Err(MonitorError::Elf(format!("{path} is not little-endian")));
    }

    let section = |i: u16| -> Option<elfparser::SectionHeader> {
        let offset = elf_hdr.shoff + (i as usize) * elf_hdr.shentsize as usize;
        elfparser::SectionHeader::new(target.get(offset..)?)
    };

    let shstrtab = section(elf_hdr.shstrndx)
        .ok_or_else(|| MonitorError::Elf(format!("{path} has no section header string table")))?;

    for i in 0..elf_hdr.shnum {
        let Some(hdr) = section(i) else { continue };

        let name_start = shstrtab.s_offset + hdr.s_name as usize;
        let Some(bytes) = target.get(name_start..) else { continue };
        let name_len = bytes.iter().position(|&b| b == 0).unwrap_or(0);
        let Ok(section_name) = std::str::from_utf8(&bytes[..name_len]) else { continue };

        if section_name == name {
            return Ok(SectionBounds {
                start: hdr.s_addr as u64,
                end: (hdr.s_addr + hdr.s_size - 1) as u64,
                size: hdr.s_size as u64,
            });
        }
    }

    Err(MonitorError::Elf(format!("{path} has no section named {name}")))
}

/// Entry address plus loadable-segment free function, used only to sanity
/// check that the SUT binary is executable before attempting to trace it.
pub fn verify_executable(path: &str) -> Result<(), MonitorError> {
    let target = std::fs::read(path)
        .map_err(|e| MonitorError::Elf(format!("failed to read {path}: {e}")))?;
    let elf_hdr = elfparser::Header::new(&target)
        .ok_or_else(|| MonitorError::Elf(format!("{path} is too small to be an ELF file")))?;
    if elf_hdr.magic != ELFMAGIC {
        return Err(MonitorError::Elf(format!("{path} is not an ELF file")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};
    use std::io::Write;

    /// Builds a minimal, well-formed little-endian 64-bit ELF with a single
    /// named section plus its shstrtab, enough to exercise `find_section`.
    fn build_fake_elf(section_name: &str, addr: u64, size: u64) -> Vec<u8> {
        let mut strtab = Vec::new();
        strtab.push(0u8); // index 0 is always the empty string
        let name_off = strtab.len() as u32;
        strtab.extend_from_slice(section_name.as_bytes());
        strtab.push(0);
        let shstrtab_name_off = strtab.len() as u32;
        strtab.extend_from_slice(b".shstrtab");
        strtab.push(0);

        let ehsize = 64usize;
        let shentsize = 64usize;
        let strtab_offset = ehsize;
        let shoff = strtab_offset + strtab.len();

        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(ELFMAGIC).unwrap();
        buf.write_u8(ARCH64).unwrap();
        buf.write_u8(LITTLEENDIAN).unwrap();
        buf.write_u8(0).unwrap(); // ident_abi_version
        buf.write_u8(0).unwrap(); // target_platform
        buf.write_u8(0).unwrap(); // abi_version
        buf.write_all(&[0u8; 7]).unwrap(); // padding
        buf.write_u16::<LittleEndian>(2).unwrap(); // o_type = ET_EXEC
        buf.write_u16::<LittleEndian>(0xf3).unwrap(); // machine
        buf.write_u32::<LittleEndian>(1).unwrap(); // version
        buf.write_u64::<LittleEndian>(0).unwrap(); // entry_addr
        buf.write_u64::<LittleEndian>(0).unwrap(); // phoff
        buf.write_u64::<LittleEndian>(shoff as u64).unwrap(); // shoff
        buf.write_u32::<LittleEndian>(0).unwrap(); // flags
        buf.write_u16::<LittleEndian>(ehsize as u16).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap(); // phentsize
        buf.write_u16::<LittleEndian>(0).unwrap(); // phnum
        buf.write_u16::<LittleEndian>(shentsize as u16).unwrap();
        buf.write_u16::<LittleEndian>(2).unwrap(); // shnum: [named section, shstrtab]
        buf.write_u16::<LittleEndian>(1).unwrap(); // shstrndx

        assert_eq!(buf.len(), ehsize);
        buf.extend_from_slice(&strtab);
        assert_eq!(buf.len(), shoff);

        // section 0: the named section
        buf.write_u32::<LittleEndian>(name_off).unwrap();
        buf.write_u32::<LittleEndian>(1).unwrap(); // s_type = SHT_PROGBITS
        buf.write_u64::<LittleEndian>(0x6).unwrap(); // s_flags
        buf.write_u64::<LittleEndian>(addr).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap(); // s_offset (unused by the test)
        buf.write_u64::<LittleEndian>(size).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(16).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();

        // section 1: .shstrtab
        buf.write_u32::<LittleEndian>(shstrtab_name_off).unwrap();
        buf.write_u32::<LittleEndian>(SHT_STRTAB).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(strtab_offset as u64).unwrap();
        buf.write_u64::<LittleEndian>(strtab.len() as u64).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(1).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();

        buf
    }

    #[test]
    fn finds_named_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sut");
        std::fs::write(&path, build_fake_elf(".text", 0x400000, 0x1000)).unwrap();

        let bounds = find_section(path.to_str().unwrap(), ".text").unwrap();
        assert_eq!(bounds.start, 0x400000);
        assert_eq!(bounds.end, 0x400FFF);
        assert_eq!(bounds.size, 0x1000);
    }

    #[test]
    fn missing_section_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sut");
        std::fs::write(&path, build_fake_elf(".text", 0x400000, 0x1000)).unwrap();

        assert!(find_section(path.to_str().unwrap(), ".data").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(find_section("/nonexistent/path/to/sut", ".text").is_err());
    }
}
