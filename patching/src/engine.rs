//! Setup layer: attach to the host module, then run a set of independent,
//! named patch routines against it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{PatchError, Result};
use crate::module::ModuleImage;
use crate::patch;
use crate::scan::ScanHit;
use crate::signature::ByteSignature;

#[cfg(target_arch = "x86_64")]
use crate::{context::RegisterContext, hooks};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Shown in the load banner.
    pub name: String,
    pub version: String,
    /// Wait before touching the host, for hosts that unpack or initialise
    /// their code after the patch library is loaded.
    pub injection_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            injection_delay: Duration::ZERO,
        }
    }
}

pub struct Engine<'a> {
    config: EngineConfig,
    image: ModuleImage<'a>,
}

impl Engine<'static> {
    /// Logs the load banner and the host module, then waits out the
    /// configured injection delay.
    pub fn attach(config: EngineConfig) -> Result<Self> {
        info!("{} v{} loaded.", config.name, config.version);

        let image = ModuleImage::current().inspect_err(|err| {
            error!("Failed to locate host module: {}", err);
        })?;
        info!("Module Name: {}", image.name());
        if let Some(path) = image.path() {
            info!("Module Path: {}", path.display());
        }
        info!("Module Address: {:#x}", image.base());
        match image.timestamp() {
            Some(timestamp) => info!("Module Timestamp: {}", timestamp),
            None => info!("Module Timestamp: unknown"),
        }

        if !config.injection_delay.is_zero() {
            info!(
                "Waiting {}ms before patching",
                config.injection_delay.as_millis()
            );
            std::thread::sleep(config.injection_delay);
        }

        Ok(Self { config, image })
    }
}

impl<'a> Engine<'a> {
    /// An engine over an arbitrary image. No banner, no delay.
    pub fn with_image(config: EngineConfig, image: ModuleImage<'a>) -> Self {
        Self { config, image }
    }

    pub fn image(&self) -> &ModuleImage<'a> {
        &self.image
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn find(&self, name: &str, signature: &ByteSignature) -> Result<ScanHit> {
        self.image.find(name, signature)
    }

    pub fn find_pattern(&self, name: &str, pattern: &str) -> Result<ScanHit> {
        self.image.find_pattern(name, pattern)
    }

    pub fn resolve(&self, name: &str, site: usize, displacement_offset: usize) -> Result<usize> {
        self.image.resolve(name, site, displacement_offset)
    }

    /// Overwrites bytes inside the image.
    ///
    /// # Safety
    /// See [`patch::write_bytes`].
    pub unsafe fn patch_bytes(&self, name: &str, address: usize, bytes: &[u8]) -> Result<()> {
        let result = self
            .image
            .checked_range(address, bytes.len())
            .and_then(|()| unsafe { patch::write_bytes(address, bytes) });

        match &result {
            Ok(()) => info!(
                "{}: Patched {} bytes at {}",
                name,
                bytes.len(),
                self.image.describe(address)
            ),
            Err(err) => error!(
                "{}: Failed to patch {}: {}",
                name,
                self.image.describe(address),
                err
            ),
        }
        result
    }

    /// # Safety
    /// See [`patch::nop`].
    pub unsafe fn patch_nop(&self, name: &str, address: usize, len: usize) -> Result<()> {
        unsafe { self.patch_bytes(name, address, &vec![patch::NOP; len]) }
    }

    /// Installs an interception at `address`, which must lie inside the image.
    ///
    /// # Safety
    /// See [`hooks::Interceptor::install`].
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn intercept<F>(
        &self,
        name: &str,
        address: usize,
        callback: F,
    ) -> Result<hooks::InterceptHandle>
    where
        F: Fn(&mut RegisterContext) + Send + Sync + 'static,
    {
        let result = self
            .image
            .checked_range(address, hooks::JUMP_SIZE)
            .and_then(|()| unsafe { hooks::install(address, callback) });

        match &result {
            Ok(handle) => info!(
                "{}: Hooked {} ({} bytes displaced)",
                name,
                self.image.describe(address),
                handle.displaced_len()
            ),
            Err(err) => error!(
                "{}: Failed to hook {}: {}",
                name,
                self.image.describe(address),
                err
            ),
        }
        result
    }

    /// Runs every routine in `patches`. A failing or panicking routine is
    /// logged and skipped; the rest still run.
    pub fn apply(&self, patches: PatchSet<'a>) -> PatchReport {
        let mut report = PatchReport::default();

        for (name, routine) in patches.routines {
            let outcome = catch_unwind(AssertUnwindSafe(|| routine(self)))
                .unwrap_or_else(|_| Err(PatchError::RoutinePanicked(name.clone())));

            match outcome {
                Ok(()) => report.applied.push(name),
                Err(err) => {
                    if err.is_not_found() {
                        warn!("{}: Skipped: {}", name, err);
                    } else {
                        error!("{}: Skipped: {}", name, err);
                    }
                    report.skipped.push((name, err));
                }
            }
        }

        info!(
            "Applied {} of {} patches",
            report.applied.len(),
            report.applied.len() + report.skipped.len()
        );
        report
    }
}

type Routine<'a> = Box<dyn FnOnce(&Engine<'a>) -> Result<()> + 'a>;

/// Ordered, named patch routines for [`Engine::apply`].
#[derive(Default)]
pub struct PatchSet<'a> {
    routines: Vec<(String, Routine<'a>)>,
}

impl<'a> PatchSet<'a> {
    pub fn new() -> Self {
        Self {
            routines: Vec::new(),
        }
    }

    pub fn with<F>(mut self, name: &str, routine: F) -> Self
    where
        F: FnOnce(&Engine<'a>) -> Result<()> + 'a,
    {
        self.routines.push((name.to_string(), Box::new(routine)));
        self
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct PatchReport {
    pub applied: Vec<String>,
    pub skipped: Vec<(String, PatchError)>,
}

impl PatchReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}
