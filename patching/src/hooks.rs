//! Mid-function interception.
//!
//! The first whole instructions at a site are moved into a stub on the
//! trampoline heap and replaced with a `jmp` to it. The stub saves every
//! register, calls the site's callback with a [`RegisterContext`], restores the
//! (possibly modified) registers, runs the moved instructions and jumps back.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, error};

use crate::asm::{DefaultHookAssembler, HookAssembler, MAX_INSTRUCTION_SIZE, StubFrame};
use crate::context::RegisterContext;
use crate::error::{InstallError, PatchError, Result};
use crate::mem::{
    DefaultMemoryController, HookHeap, MemoryController, MemoryError, MemoryProtection,
    ProtectedRegion,
};
use crate::patch;

/// Length of the `jmp rel32` written over a site.
pub const JUMP_SIZE: usize = 5;

/// Stubs are placed this close to their site so both jumps stay rel32.
pub const MAX_TRAMPOLINE_DISTANCE: usize = 0x4000_0000;

const MAX_STUB_SIZE: usize = 1024;

pub type Callback = Box<dyn Fn(&mut RegisterContext) + Send + Sync + 'static>;

type DispatchFn = unsafe extern "C" fn(*mut RegisterContext, *const SiteRecord);

/// Per-site state reached from a stub. Lives for the rest of the process.
pub struct SiteRecord {
    address: usize,
    callback: Callback,
    hits: AtomicU64,
}

unsafe extern "C" fn dispatch(context: *mut RegisterContext, site: *const SiteRecord) {
    let (context, site) = unsafe { (&mut *context, &*site) };
    site.hits.fetch_add(1, Ordering::Relaxed);

    if catch_unwind(AssertUnwindSafe(|| (site.callback)(context))).is_err() {
        error!(
            site = format_args!("{:#x}", site.address),
            "interception callback panicked"
        );
    }
}

/// A live interception. Dropping the handle leaves the interception in place.
pub struct InterceptHandle {
    address: usize,
    trampoline: usize,
    original: Vec<u8>,
    site: &'static SiteRecord,
}

impl InterceptHandle {
    pub fn address(&self) -> usize {
        self.address
    }

    /// Number of original bytes moved into the stub.
    pub fn displaced_len(&self) -> usize {
        self.original.len()
    }

    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    /// Times the callback has been entered.
    pub fn hits(&self) -> u64 {
        self.site.hits.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for InterceptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptHandle")
            .field("address", &format_args!("{:#x}", self.address))
            .field("trampoline", &format_args!("{:#x}", self.trampoline))
            .field("displaced_len", &self.displaced_len())
            .field("hits", &self.hits())
            .finish()
    }
}

pub struct Interceptor {
    heap: HookHeap<DefaultMemoryController>,
    assembler: DefaultHookAssembler,
    /// Site address to displaced length.
    sites: Mutex<BTreeMap<usize, usize>>,
}

static INTERCEPTOR: Interceptor = Interceptor::new();

impl Default for Interceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor {
    pub const fn new() -> Self {
        Self {
            heap: HookHeap::new(),
            assembler: DefaultHookAssembler::new(),
            sites: Mutex::new(BTreeMap::new()),
        }
    }

    /// The process-wide interceptor.
    pub fn global() -> &'static Interceptor {
        &INTERCEPTOR
    }

    fn sites(&self) -> std::result::Result<MutexGuard<'_, BTreeMap<usize, usize>>, MemoryError> {
        self.sites.lock().map_err(|_| MemoryError::BadTableState)
    }

    /// How many of the `wanted` bytes from `address` can be read, stopping at
    /// the first unmapped or no-access page.
    fn readable_len(
        &self,
        address: usize,
        wanted: usize,
    ) -> std::result::Result<usize, MemoryError> {
        let regions = match unsafe { self.heap.mem.query_protection(address, wanted) } {
            Ok(regions) => regions,
            Err(MemoryError::Unmapped(end)) if end > address => unsafe {
                self.heap.mem.query_protection(address, end - address)?
            },
            Err(err) => return Err(err),
        };

        let end = regions
            .iter()
            .take_while(|region| region.protection != MemoryProtection::NoAccess)
            .last()
            .map_or(address, ProtectedRegion::end);
        Ok(end.saturating_sub(address).min(wanted))
    }

    /// Runs `callback` every time a thread reaches `address`.
    ///
    /// # Safety
    /// `address` must be the first byte of an instruction, and no thread may
    /// be executing, or later branch into, the bytes after it that get
    /// displaced.
    pub unsafe fn install<F>(&self, address: usize, callback: F) -> Result<InterceptHandle>
    where
        F: Fn(&mut RegisterContext) + Send + Sync + 'static,
    {
        unsafe { self.try_install(address, Box::new(callback)) }.map_err(|source| {
            error!(
                site = format_args!("{:#x}", address),
                "failed to install interception: {}", source
            );
            PatchError::InterceptionInstallFailed { address, source }
        })
    }

    unsafe fn try_install(
        &self,
        address: usize,
        callback: Callback,
    ) -> std::result::Result<InterceptHandle, InstallError> {
        if address == 0 {
            return Err(InstallError::NullAddress);
        }

        let mut sites = self.sites()?;
        if let Some(start) = overlapping(&sites, address, 1) {
            return Err(InstallError::AlreadyInstalled(start));
        }

        let readable = self.readable_len(address, JUMP_SIZE + MAX_INSTRUCTION_SIZE)?;
        let code = unsafe { std::slice::from_raw_parts(address as *const u8, readable) };
        let displaced = self.assembler.decode_displaced(address, code, JUMP_SIZE)?;
        if let Some(start) = overlapping(&sites, address, displaced.len) {
            return Err(InstallError::AlreadyInstalled(start));
        }

        let record = Box::new(SiteRecord {
            address,
            callback,
            hits: AtomicU64::new(0),
        });
        let frame = StubFrame {
            dispatch: dispatch as DispatchFn as usize,
            site: &*record as *const SiteRecord as usize,
        };

        let trampoline = {
            let mut heap = self.heap.get_handle()?;
            let mut writer = unsafe {
                heap.begin_write_near(address, MAX_STUB_SIZE, MAX_TRAMPOLINE_DISTANCE)?
            };
            let stub = self
                .assembler
                .assemble_stub(writer.write_address(), &frame, &displaced)?;
            unsafe { writer.write_bytes(&stub)? }
        };

        let redirect = self
            .assembler
            .assemble_patch(address, trampoline, displaced.len)?;
        unsafe { patch::write_bytes(address, &redirect) }
            .map_err(|err| InstallError::Write(Box::new(err)))?;

        sites.insert(address, displaced.len);
        debug!(
            site = format_args!("{:#x}", address),
            trampoline = format_args!("{:#x}", trampoline),
            len = displaced.len,
            "installed interception"
        );

        Ok(InterceptHandle {
            address,
            trampoline,
            original: displaced.original,
            site: Box::leak(record),
        })
    }

    /// Puts the original bytes back. The stub and the callback stay allocated
    /// since a thread may still be running inside them.
    ///
    /// # Safety
    /// No thread may be executing the redirecting `jmp` while it is replaced.
    pub unsafe fn uninstall(&self, handle: InterceptHandle) -> Result<()> {
        let mut sites = self.sites()?;
        unsafe { patch::write_bytes(handle.address, &handle.original)? };
        sites.remove(&handle.address);

        debug!(
            site = format_args!("{:#x}", handle.address),
            hits = handle.hits(),
            "removed interception"
        );
        Ok(())
    }

    pub fn installed(&self) -> usize {
        self.sites().map(|sites| sites.len()).unwrap_or(0)
    }
}

/// Start of a live site that `[address, address + len)` would overlap.
fn overlapping(sites: &BTreeMap<usize, usize>, address: usize, len: usize) -> Option<usize> {
    if let Some((&start, &site_len)) = sites.range(..=address).next_back() {
        if address < start + site_len {
            return Some(start);
        }
    }
    sites
        .range(address..address + len)
        .next()
        .map(|(&start, _)| start)
}

/// [`Interceptor::install`] on the global interceptor.
///
/// # Safety
/// See [`Interceptor::install`].
pub unsafe fn install<F>(address: usize, callback: F) -> Result<InterceptHandle>
where
    F: Fn(&mut RegisterContext) + Send + Sync + 'static,
{
    unsafe { Interceptor::global().install(address, callback) }
}

/// [`Interceptor::uninstall`] on the global interceptor.
///
/// # Safety
/// See [`Interceptor::uninstall`].
pub unsafe fn uninstall(handle: InterceptHandle) -> Result<()> {
    unsafe { Interceptor::global().uninstall(handle) }
}
