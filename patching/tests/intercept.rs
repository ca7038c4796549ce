#![cfg(all(target_os = "linux", target_arch = "x86_64"))]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use patching::asm::AssemblyError;
use patching::hooks::{self, Interceptor};
use patching::{ElementMarker, Engine, EngineConfig, InstallError, ModuleImage, PatchError, patch};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Copies `code` into a fresh read-execute page. The page is never unmapped:
/// interception sites stay registered for the life of the process.
fn executable(code: &[u8]) -> usize {
    let size = 0x1000;
    let page = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(page, libc::MAP_FAILED);
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), page as *mut u8, code.len());
        assert_eq!(libc::mprotect(page, size, libc::PROT_READ | libc::PROT_EXEC), 0);
    }
    page as usize
}

/// Copies `code` to the very end of a read-execute page followed by a
/// no-access page.
fn executable_at_page_end(code: &[u8]) -> usize {
    let size = 0x1000;
    let page = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            2 * size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(page, libc::MAP_FAILED);

    let start = page as usize + size - code.len();
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), start as *mut u8, code.len());
        assert_eq!(libc::mprotect(page, size, libc::PROT_READ | libc::PROT_EXEC), 0);
        let guard = (page as usize + size) as *mut libc::c_void;
        assert_eq!(libc::mprotect(guard, size, libc::PROT_NONE), 0);
    }
    start
}

unsafe fn as_fn<R>(address: usize) -> extern "C" fn() -> R {
    unsafe { std::mem::transmute::<usize, extern "C" fn() -> R>(address) }
}

// mov eax, 0x3F800000; movd xmm0, eax; nop x5; ret
const RETURNS_ONE: [u8; 15] = [
    0xB8, 0x00, 0x00, 0x80, 0x3F, 0x66, 0x0F, 0x6E, 0xC0, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3,
];

// mov rax, 7; add rax, 1; nop; ret
const RETURNS_EIGHT: [u8; 13] = [
    0x48, 0xC7, 0xC0, 0x07, 0x00, 0x00, 0x00, 0x48, 0x83, 0xC0, 0x01, 0x90, 0xC3,
];

#[test]
fn test_callback_rewrites_float_return() {
    init_tracing();
    let function = executable(&RETURNS_ONE);
    let get = unsafe { as_fn::<f32>(function) };
    assert_eq!(get(), 1.0);

    let handle = unsafe {
        hooks::install(function + 9, |ctx| ctx.xmm0.set_f32(0, 16.0 / 9.0)).unwrap()
    };
    assert_eq!(handle.displaced_len(), 5);

    assert_eq!(get(), 16.0 / 9.0);
    assert_eq!(handle.hits(), 1);
}

#[test]
fn test_callback_sees_and_sets_registers() {
    init_tracing();
    let function = executable(&RETURNS_EIGHT);
    let get = unsafe { as_fn::<u64>(function) };

    let seen = Arc::new(AtomicU64::new(0));
    let handle = {
        let seen = seen.clone();
        unsafe {
            hooks::install(function + 7, move |ctx| {
                seen.store(ctx.rax, Ordering::Relaxed);
                ctx.rax = 100;
            })
            .unwrap()
        }
    };

    assert_eq!(get(), 101);
    assert_eq!(seen.load(Ordering::Relaxed), 7);
    assert_eq!(handle.displaced_len(), 5);
    assert_ne!(handle.trampoline(), 0);
}

#[test]
fn test_rip_relative_instruction_is_relocated() {
    init_tracing();
    // movss xmm0, [rip+8]; ret; ... 2.5f32 at +16
    let mut code = [0xCCu8; 20];
    code[..8].copy_from_slice(&[0xF3, 0x0F, 0x10, 0x05, 0x08, 0x00, 0x00, 0x00]);
    code[8] = 0xC3;
    code[16..20].copy_from_slice(&2.5f32.to_le_bytes());

    let function = executable(&code);
    let get = unsafe { as_fn::<f32>(function) };

    let handle = unsafe { hooks::install(function, |_| {}).unwrap() };
    assert_eq!(handle.displaced_len(), 8);
    assert_eq!(get(), 2.5);
    assert_eq!(handle.hits(), 1);
}

#[test]
fn test_second_install_is_rejected() {
    init_tracing();
    let function = executable(&RETURNS_EIGHT);
    let get = unsafe { as_fn::<u64>(function) };
    let site = function + 7;

    let handle = unsafe { hooks::install(site, |_| {}).unwrap() };

    for address in [site, site + 1, site + 4] {
        let err = unsafe { hooks::install(address, |ctx| ctx.rax = 0) }.unwrap_err();
        assert!(matches!(
            err,
            PatchError::InterceptionInstallFailed {
                source: InstallError::AlreadyInstalled(start),
                ..
            } if start == site
        ));
    }

    assert_eq!(get(), 8);
    assert_eq!(get(), 8);
    assert_eq!(handle.hits(), 2);
}

#[test]
fn test_panicking_callback_keeps_running() {
    init_tracing();
    let function = executable(&RETURNS_EIGHT);
    let get = unsafe { as_fn::<u64>(function) };

    let handle = unsafe {
        hooks::install(function + 7, |ctx| {
            ctx.rax = 100;
            panic!("callback bug");
        })
        .unwrap()
    };

    assert_eq!(get(), 101);
    assert_eq!(get(), 101);
    assert_eq!(handle.hits(), 2);
}

#[test]
fn test_concurrent_hits_are_counted() {
    init_tracing();
    let function = executable(&RETURNS_EIGHT);
    let get = unsafe { as_fn::<u64>(function) };

    let handle = unsafe { hooks::install(function + 7, |ctx| ctx.rax += 10).unwrap() };

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(move || {
                for _ in 0..1000 {
                    assert_eq!(get(), 18);
                }
            });
        }
    });
    assert_eq!(handle.hits(), 8000);
}

#[test]
fn test_uninstall_restores_original_bytes() {
    init_tracing();
    let function = executable(&RETURNS_EIGHT);
    let get = unsafe { as_fn::<u64>(function) };
    let site = function + 7;
    let interceptor = Interceptor::new();

    let handle = unsafe { interceptor.install(site, |ctx| ctx.rax = 0).unwrap() };
    assert_eq!(interceptor.installed(), 1);
    assert_eq!(unsafe { patch::read_bytes(site, 1) }, [0xE9]);
    assert_eq!(get(), 1);

    unsafe { interceptor.uninstall(handle).unwrap() };
    assert_eq!(interceptor.installed(), 0);
    assert_eq!(unsafe { patch::read_bytes(function, RETURNS_EIGHT.len()) }, RETURNS_EIGHT);
    assert_eq!(get(), 8);

    let handle = unsafe { interceptor.install(site, |ctx| ctx.rax = 1).unwrap() };
    assert_eq!(get(), 2);
    assert_eq!(handle.hits(), 1);
}

#[test]
fn test_engine_scans_then_intercepts() {
    init_tracing();
    let function = executable(&RETURNS_ONE);
    let get = unsafe { as_fn::<f32>(function) };

    let image = ModuleImage::from_named_slice("host", unsafe {
        std::slice::from_raw_parts(function as *const u8, RETURNS_ONE.len())
    });
    let engine = Engine::with_image(EngineConfig::default(), image);

    let hit = engine.find_pattern("Aspect Ratio", "66 0F 6E C0 90").unwrap();
    let site = hit.displaced(4).address;

    let handle = unsafe {
        engine
            .intercept("Aspect Ratio", site, |ctx| ctx.xmm0.set_f32(0, 21.0 / 9.0))
            .unwrap()
    };
    assert_eq!(get(), 21.0 / 9.0);
    assert_eq!(handle.address(), function + 9);

    // a site too close to the end of the image for a jump
    let err = unsafe { engine.intercept("Tail", function + 12, |_| {}) }.unwrap_err();
    assert!(matches!(err, PatchError::OutOfBounds { .. }));
}

#[test]
fn test_callback_writes_through_register_pointer() {
    init_tracing();
    // mov rax, rdi; nop x5; ret
    let function = executable(&[0x48, 0x89, 0xF8, 0x90, 0x90, 0x90, 0x90, 0x90, 0xC3]);
    let touch = unsafe { std::mem::transmute::<usize, extern "C" fn(usize) -> usize>(function) };

    let marker = ElementMarker::new(0x10, 0x01);
    let fixed = Arc::new(AtomicU64::new(0));
    let _handle = {
        let fixed = fixed.clone();
        unsafe {
            hooks::install(function + 3, move |ctx| {
                let element = ctx.rdi as usize;
                if marker.try_mark(element) {
                    patch::store_value(element + 8, patch::read_value::<f32>(element + 8) * 0.75);
                    fixed.fetch_add(1, Ordering::Relaxed);
                }
            })
            .unwrap()
        }
    };

    let mut element = [0u8; 0x20];
    element[8..12].copy_from_slice(&1920.0f32.to_le_bytes());
    let address = element.as_mut_ptr() as usize;

    assert_eq!(touch(address), address);
    assert_eq!(touch(address), address);

    assert_eq!(fixed.load(Ordering::Relaxed), 1);
    assert_eq!(unsafe { patch::read_value::<f32>(address + 8) }, 1440.0);
    assert_eq!(element[0x10], 0x01);
}

#[test]
fn test_undecodable_site_is_left_untouched() {
    init_tracing();
    // push es is invalid in 64-bit mode
    let code = [0x06, 0x06, 0x06, 0x06, 0x06, 0x06, 0xC3];
    let function = executable(&code);
    let interceptor = Interceptor::new();

    let err = unsafe { interceptor.install(function, |_| {}) }.unwrap_err();
    assert!(matches!(
        err,
        PatchError::InterceptionInstallFailed {
            address,
            source: InstallError::Assembly(AssemblyError::InvalidInstruction(at)),
        } if address == function && at == function
    ));
    assert_eq!(unsafe { patch::read_bytes(function, code.len()) }, code);
    assert_eq!(interceptor.installed(), 0);
}

#[test]
fn test_site_next_to_guard_page() {
    init_tracing();
    let function = executable_at_page_end(&RETURNS_EIGHT);
    let get = unsafe { as_fn::<u64>(function) };
    let interceptor = Interceptor::new();

    // add rax, 1; nop; ret are the last six readable bytes
    let handle = unsafe { interceptor.install(function + 7, |ctx| ctx.rax = 100).unwrap() };
    assert_eq!(handle.displaced_len(), 5);
    assert_eq!(get(), 101);

    // nop; nop; ret cannot hold a jump
    let function = executable_at_page_end(&[0x90, 0x90, 0xC3]);
    let err = unsafe { interceptor.install(function, |_| {}) }.unwrap_err();
    assert!(matches!(
        err,
        PatchError::InterceptionInstallFailed {
            source: InstallError::Assembly(AssemblyError::RelocationError),
            ..
        }
    ));
    assert_eq!(unsafe { patch::read_bytes(function, 3) }, [0x90, 0x90, 0xC3]);
}
