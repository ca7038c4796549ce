use std::ffi::c_void;
use std::mem::{MaybeUninit, size_of};
use std::os::windows::ffi::OsStringExt;
use std::path::PathBuf;

use super::super::*;

use windows_sys::Win32::System::Diagnostics::Debug::{FlushInstructionCache, IMAGE_NT_HEADERS64};
use windows_sys::Win32::System::LibraryLoader::{GetModuleFileNameW, GetModuleHandleW};
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RESERVE, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
    PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
    VirtualQuery, MEM_RELEASE,
};
use windows_sys::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
use windows_sys::Win32::System::SystemServices::IMAGE_DOS_HEADER;
use windows_sys::Win32::System::Threading::GetCurrentProcess;

pub struct WindowsMemoryController;

impl WindowsMemoryController {
    pub const fn new() -> Self {
        Self
    }

    unsafe fn get_system_info(&self) -> SYSTEM_INFO {
        let system_info = unsafe {
            let mut system_info = MaybeUninit::<SYSTEM_INFO>::uninit();
            GetSystemInfo(system_info.as_mut_ptr());
            system_info.assume_init()
        };
        system_info
    }

    fn allocation_granularity(&self) -> usize {
        unsafe { self.get_system_info().dwAllocationGranularity as usize }
    }

    pub fn protection_from_native(flags: u32) -> MemoryProtection {
        match flags {
            PAGE_NOACCESS => MemoryProtection::NoAccess,
            PAGE_READONLY => MemoryProtection::ReadOnly,
            PAGE_READWRITE => MemoryProtection::ReadWrite,
            PAGE_EXECUTE_READ => MemoryProtection::ReadExecute,
            PAGE_EXECUTE_READWRITE => MemoryProtection::ReadWriteExecute,
            other => MemoryProtection::Other(other),
        }
    }

    fn get_native_protection_flags(&self, protection: MemoryProtection) -> u32 {
        match protection {
            MemoryProtection::NoAccess => PAGE_NOACCESS,
            MemoryProtection::ReadOnly => PAGE_READONLY,
            MemoryProtection::ReadWrite => PAGE_READWRITE,
            MemoryProtection::ReadExecute => PAGE_EXECUTE_READ,
            MemoryProtection::ReadWriteExecute => PAGE_EXECUTE_READWRITE,
            MemoryProtection::Other(flags) => flags,
        }
    }

    unsafe fn native_set_page_protection(
        &self,
        page: usize,
        size: usize,
        protection: u32,
    ) -> Result<()> {
        let success = unsafe {
            let mut old_protection = 0u32;
            VirtualProtect(
                page as *const c_void,
                size,
                protection,
                &mut old_protection,
            ) != 0
        };
        if !success {
            Err(MemoryError::CantSetMemoryProtection(page))
        } else {
            Ok(())
        }
    }

    unsafe fn query(&self, address: usize) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
        let written = unsafe {
            VirtualQuery(
                address as *const c_void,
                info.as_mut_ptr(),
                size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            None
        } else {
            Some(unsafe { info.assume_init() })
        }
    }

    unsafe fn module_timestamp(&self, base: usize) -> Option<u64> {
        unsafe {
            let dos = &*(base as *const IMAGE_DOS_HEADER);
            let nt = &*((base + dos.e_lfanew as usize) as *const IMAGE_NT_HEADERS64);
            Some(nt.FileHeader.TimeDateStamp as u64)
        }
    }
}

impl MemoryController for WindowsMemoryController {
    fn page_size(&self) -> usize {
        unsafe { self.get_system_info().dwPageSize as usize }
    }

    unsafe fn query_protection(&self, address: usize, size: usize) -> Result<Vec<ProtectedRegion>> {
        let page_size = self.page_size();
        let start = align_down(page_size, address);
        let end = align_up(page_size, address + size.max(1));

        let mut regions = Vec::new();
        let mut cursor = start;
        while cursor < end {
            let info = unsafe { self.query(cursor) }
                .ok_or(MemoryError::CantQueryMemoryProtection(cursor))?;
            if info.State != MEM_COMMIT {
                return Err(MemoryError::Unmapped(cursor));
            }

            let region_end = (info.BaseAddress as usize + info.RegionSize).min(end);
            regions.push(ProtectedRegion {
                start: cursor,
                size: region_end - cursor,
                protection: Self::protection_from_native(info.Protect),
            });
            cursor = region_end;
        }

        Ok(regions)
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
        // Windows 64bit will allocate memory very far away from where modules
        // are loaded by default, so walk outwards from the target instead.
        let granularity = self.allocation_granularity();
        let size = align_up(self.page_size(), size);
        let origin = align_down(granularity, target);
        let steps = max_distance / granularity;

        for step in 1..=steps {
            let offset = step * granularity;
            let candidates = [origin.checked_sub(offset), origin.checked_add(offset)];

            for hint in candidates.into_iter().flatten() {
                if hint == 0 {
                    continue;
                }
                let address = unsafe {
                    VirtualAlloc(
                        hint as *const c_void,
                        size,
                        MEM_COMMIT | MEM_RESERVE,
                        PAGE_READWRITE,
                    )
                };
                if address.is_null() {
                    continue;
                }
                let address = address as usize;
                if within_distance(target, address, size, max_distance) {
                    return Ok(Allocation {
                        start: address,
                        size,
                    });
                }
                unsafe {
                    VirtualFree(address as *mut c_void, 0, MEM_RELEASE);
                }
            }
        }

        Err(MemoryError::CantAllocateNear {
            target,
            max_distance,
        })
    }

    unsafe fn flush_instruction_cache(&self, address: usize, size: usize) {
        unsafe {
            FlushInstructionCache(GetCurrentProcess(), address as *const c_void, size);
        }
    }

    fn current_module(&self) -> Result<ModuleInfo> {
        let module = unsafe { GetModuleHandleW(std::ptr::null()) };
        if module.is_null() {
            return Err(MemoryError::CantFindModule("<process executable>".into()));
        }

        let info = unsafe {
            let mut info = MaybeUninit::<MODULEINFO>::uninit();
            let success = GetModuleInformation(
                GetCurrentProcess(),
                module,
                info.as_mut_ptr(),
                size_of::<MODULEINFO>() as u32,
            ) != 0;
            if !success {
                return Err(MemoryError::CantFindModule("<process executable>".into()));
            }
            info.assume_init()
        };

        let path = {
            let mut buffer = vec![0u16; 1024];
            let len = unsafe { GetModuleFileNameW(module, buffer.as_mut_ptr(), buffer.len() as u32) };
            PathBuf::from(std::ffi::OsString::from_wide(&buffer[..len as usize]))
        };
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        let base = info.lpBaseOfDll as usize;
        Ok(ModuleInfo {
            base,
            size: info.SizeOfImage as usize,
            name,
            path,
            timestamp: unsafe { self.module_timestamp(base) },
        })
    }
}
