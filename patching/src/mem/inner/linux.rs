use std::ffi::c_void;
use std::fs;
use std::time::UNIX_EPOCH;

use super::super::*;

/// One line of `/proc/self/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapsEntry {
    pub start: usize,
    pub end: usize,
    pub protection: MemoryProtection,
    pub path: Option<String>,
}

impl MapsEntry {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        // offset, device, inode
        let mut fields = fields.skip(3);
        let path = fields.next().map(|first| {
            // Paths may contain spaces; re-join whatever remains.
            std::iter::once(first)
                .chain(fields)
                .collect::<Vec<_>>()
                .join(" ")
        });

        let (start, end) = range.split_once('-')?;
        let start = usize::from_str_radix(start, 16).ok()?;
        let end = usize::from_str_radix(end, 16).ok()?;

        let perms = perms.as_bytes();
        if perms.len() < 3 {
            return None;
        }
        let mut flags = libc::PROT_NONE;
        if perms[0] == b'r' {
            flags |= libc::PROT_READ;
        }
        if perms[1] == b'w' {
            flags |= libc::PROT_WRITE;
        }
        if perms[2] == b'x' {
            flags |= libc::PROT_EXEC;
        }

        Some(Self {
            start,
            end,
            protection: LinuxMemoryController::protection_from_native(flags),
            path,
        })
    }
}

pub fn parse_maps(maps: &str) -> Vec<MapsEntry> {
    maps.lines().filter_map(MapsEntry::parse).collect()
}

fn read_maps() -> Result<Vec<MapsEntry>> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    Ok(parse_maps(&maps))
}

/// Splits `[start, end)` into the runs of `entries` covering it.
pub fn regions_covering(
    entries: &[MapsEntry],
    start: usize,
    end: usize,
) -> Result<Vec<ProtectedRegion>> {
    let mut regions = Vec::new();
    let mut cursor = start;

    for entry in entries {
        if cursor >= end {
            break;
        }
        if entry.end <= cursor {
            continue;
        }
        if entry.start > cursor {
            return Err(MemoryError::Unmapped(cursor));
        }

        let region_end = entry.end.min(end);
        regions.push(ProtectedRegion {
            start: cursor,
            size: region_end - cursor,
            protection: entry.protection,
        });
        cursor = region_end;
    }

    if cursor < end {
        return Err(MemoryError::Unmapped(cursor));
    }
    Ok(regions)
}

fn is_readable(protection: MemoryProtection) -> bool {
    match protection {
        MemoryProtection::NoAccess => false,
        MemoryProtection::Other(flags) => flags as i32 & libc::PROT_READ != 0,
        _ => true,
    }
}

fn is_executable(protection: MemoryProtection) -> bool {
    match protection {
        MemoryProtection::ReadExecute | MemoryProtection::ReadWriteExecute => true,
        MemoryProtection::Other(flags) => flags as i32 & libc::PROT_EXEC != 0,
        _ => false,
    }
}

pub struct LinuxMemoryController;

impl LinuxMemoryController {
    pub const fn new() -> Self {
        Self
    }

    unsafe fn sys_get_page_size(&self) -> usize {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    /// Mappings are handed out at this granularity so chunks don't fragment
    /// the area around the target.
    fn allocation_granularity(&self) -> usize {
        self.page_size().max(0x1_0000)
    }

    pub fn protection_from_native(flags: i32) -> MemoryProtection {
        const RW: i32 = libc::PROT_READ | libc::PROT_WRITE;
        const RX: i32 = libc::PROT_READ | libc::PROT_EXEC;
        const RWX: i32 = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;

        match flags {
            libc::PROT_NONE => MemoryProtection::NoAccess,
            libc::PROT_READ => MemoryProtection::ReadOnly,
            RW => MemoryProtection::ReadWrite,
            RX => MemoryProtection::ReadExecute,
            RWX => MemoryProtection::ReadWriteExecute,
            other => MemoryProtection::Other(other as u32),
        }
    }

    fn get_native_protection_flags(&self, protection: MemoryProtection) -> i32 {
        match protection {
            MemoryProtection::NoAccess => libc::PROT_NONE,
            MemoryProtection::ReadOnly => libc::PROT_READ,
            MemoryProtection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            MemoryProtection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            MemoryProtection::ReadWriteExecute => {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            }
            MemoryProtection::Other(flags) => flags as i32,
        }
    }

    unsafe fn native_set_page_protection(
        &self,
        page: usize,
        size: usize,
        protection: i32,
    ) -> Result<()> {
        let success = unsafe { libc::mprotect(page as *mut c_void, size, protection) == 0 };
        if !success {
            Err(MemoryError::CantSetMemoryProtection(page))
        } else {
            Ok(())
        }
    }

    unsafe fn try_map_at(&self, hint: usize, size: usize) -> Option<usize> {
        let address = unsafe {
            libc::mmap(
                hint as *mut c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if address == libc::MAP_FAILED {
            None
        } else {
            Some(address as usize)
        }
    }
}

impl MemoryController for LinuxMemoryController {
    fn page_size(&self) -> usize {
        unsafe { self.sys_get_page_size() }
    }

    unsafe fn query_protection(&self, address: usize, size: usize) -> Result<Vec<ProtectedRegion>> {
        let page_size = self.page_size();
        let start = align_down(page_size, address);
        let end = align_up(page_size, address + size.max(1));

        let entries = read_maps().map_err(|_| MemoryError::CantQueryMemoryProtection(address))?;
        regions_covering(&entries, start, end)
    }

    unsafe fn set_page_protection(
        &self,
        address: usize,
        size: usize,
        protection: MemoryProtection,
    ) -> Result<()> {
        let protection = self.get_native_protection_flags(protection);

        unsafe {
            self.native_set_page_protection(address, size, protection)?;
        }

        Ok(())
    }

    unsafe fn allocate_near(
        &self,
        target: usize,
        size: usize,
        max_distance: usize,
    ) -> Result<Allocation> {
        let granularity = self.allocation_granularity();
        let size = align_up(self.page_size(), size);
        let origin = align_down(granularity, target);
        let steps = max_distance / granularity;

        // Below the target first: the area above an executable is where the
        // program break grows.
        for step in 1..=steps {
            let offset = step * granularity;
            let candidates = [origin.checked_sub(offset), origin.checked_add(offset)];

            for hint in candidates.into_iter().flatten() {
                if hint == 0 {
                    continue;
                }
                let Some(address) = (unsafe { self.try_map_at(hint, size) }) else {
                    continue;
                };
                if within_distance(target, address, size, max_distance) {
                    return Ok(Allocation {
                        start: address,
                        size,
                    });
                }
                unsafe {
                    libc::munmap(address as *mut c_void, size);
                }
            }
        }

        Err(MemoryError::CantAllocateNear {
            target,
            max_distance,
        })
    }

    unsafe fn flush_instruction_cache(&self, _address: usize, _size: usize) {
        // x86 keeps instruction fetch coherent with data writes.
    }

    fn current_module(&self) -> Result<ModuleInfo> {
        let path = std::env::current_exe()?;
        let path_str = path.to_string_lossy().into_owned();
        let entries = read_maps()?;

        // Contiguous readable runs of the executable's own mappings.
        let mut runs: Vec<(usize, usize, bool)> = Vec::new();
        let mut run_open = false;
        for entry in &entries {
            if entry.path.as_deref() != Some(path_str.as_str()) {
                run_open = false;
                continue;
            }
            if !is_readable(entry.protection) {
                run_open = false;
                continue;
            }

            let executable = is_executable(entry.protection);
            match runs.last_mut() {
                Some(run) if run_open && run.1 == entry.start => {
                    run.1 = entry.end;
                    run.2 |= executable;
                }
                _ => runs.push((entry.start, entry.end, executable)),
            }
            run_open = true;
        }

        let (base, end, _) = runs
            .iter()
            .find(|run| run.2)
            .or_else(|| runs.first())
            .copied()
            .ok_or_else(|| MemoryError::CantFindModule(path_str.clone()))?;

        let timestamp = fs::metadata(&path)
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs());

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path_str.clone());

        Ok(ModuleInfo {
            base,
            size: end - base,
            name,
            path,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d4a4a00000-55d4a4a02000 r--p 00000000 08:01 1234 /usr/bin/game
55d4a4a02000-55d4a4a10000 r-xp 00002000 08:01 1234 /usr/bin/game
55d4a4a10000-55d4a4a14000 r--p 00010000 08:01 1234 /usr/bin/game
55d4a4a15000-55d4a4a16000 rw-p 00014000 08:01 1234 /usr/bin/game
7f0000000000-7f0000001000 ---p 00000000 00:00 0
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0                          [stack]
7ffd00030000-7ffd00031000 r-xp 00000000 08:01 99 /opt/My Games/lib game.so
";

    #[test]
    fn test_parse_maps() {
        let entries = parse_maps(SAMPLE);
        assert_eq!(entries.len(), 7);
        assert_eq!(entries[1].start, 0x55d4a4a02000);
        assert_eq!(entries[1].end, 0x55d4a4a10000);
        assert_eq!(entries[1].protection, MemoryProtection::ReadExecute);
        assert_eq!(entries[3].protection, MemoryProtection::ReadWrite);
        assert_eq!(entries[4].protection, MemoryProtection::NoAccess);
        assert_eq!(entries[4].path, None);
        assert_eq!(entries[5].path.as_deref(), Some("[stack]"));
        assert_eq!(
            entries[6].path.as_deref(),
            Some("/opt/My Games/lib game.so")
        );
    }

    #[test]
    fn test_regions_covering_split_and_gap() {
        let entries = parse_maps(SAMPLE);

        let regions = regions_covering(&entries, 0x55d4a4a01000, 0x55d4a4a03000).unwrap();
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].protection, MemoryProtection::ReadOnly);
        assert_eq!(regions[0].size, 0x1000);
        assert_eq!(regions[1].start, 0x55d4a4a02000);
        assert_eq!(regions[1].protection, MemoryProtection::ReadExecute);

        // 0x55d4a4a14000..0x55d4a4a15000 is a hole.
        let err = regions_covering(&entries, 0x55d4a4a13000, 0x55d4a4a16000).unwrap_err();
        assert!(matches!(err, MemoryError::Unmapped(0x55d4a4a14000)));
    }

    #[test]
    fn test_native_protection_roundtrip() {
        let controller = LinuxMemoryController::new();
        for protection in [
            MemoryProtection::NoAccess,
            MemoryProtection::ReadOnly,
            MemoryProtection::ReadWrite,
            MemoryProtection::ReadExecute,
            MemoryProtection::ReadWriteExecute,
        ] {
            let native = controller.get_native_protection_flags(protection);
            assert_eq!(LinuxMemoryController::protection_from_native(native), protection);
        }
    }

    #[test]
    fn test_query_unmapped_page() {
        let controller = LinuxMemoryController::new();
        // Below mmap_min_addr, so nothing can ever be mapped there.
        let page = controller.page_size();

        assert!(unsafe { controller.query_protection(page, 1) }.is_err());
        assert!(unsafe {
            controller.set_page_protection(page, page, MemoryProtection::ReadWrite)
        }
        .is_err());
    }

    #[test]
    fn test_allocate_near_target() {
        let controller = LinuxMemoryController::new();
        let target = test_allocate_near_target as usize;
        let allocation = unsafe { controller.allocate_near(target, 100, 0x4000_0000).unwrap() };

        assert!(allocation.size >= 100);
        assert!(within_distance(target, allocation.start, allocation.size, 0x4000_0000));

        let regions = unsafe { controller.query_protection(allocation.start, allocation.size) }.unwrap();
        assert_eq!(regions[0].protection, MemoryProtection::ReadWrite);
    }
}
