//! Quartz kernel library
//!
//! Quartz is a freestanding x86-64 monolithic kernel with a Darwin/XNU
//! personality: it boots under a Multiboot loader, mounts a CPIO ramdisk
//! (and, when present, a virtio block device), maps Apple's `dyld` plus a
//! main Mach-O executable into the shared address space, and then services
//! the Mach trap / BSD syscall / machine-dependent surface the pair needs
//! to start running in ring 3.
//!
//! The library exports every subsystem so the parsing and layout logic can
//! be exercised by host-side unit tests; bare-metal-only pieces (the boot
//! trampoline, the IDT, the global allocator) are gated on
//! `target_os = "none"`.

#![no_std]
#![cfg_attr(all(target_os = "none", target_arch = "x86_64"), feature(abi_x86_interrupt))]

extern crate alloc;

// On bare metal the kernel heap is a linked-list allocator over frames
// handed out by the PMM. On the host (unit tests, coverage) we delegate to
// the system allocator so test code using Vec/String links against std.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Get a reference to the global kernel heap.
#[cfg(target_os = "none")]
pub(crate) fn allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot_info;
pub mod config;
pub mod darwin;
pub mod drivers;
pub mod entropy;
pub mod error;
pub mod fs;
pub mod loader;
pub mod logger;
pub mod mm;
pub mod serial;
pub mod syscall;

use config::BootConfig;

/// Virtual offset applied to every `dyld` segment. Chosen above the main
/// executable's customary 4 GiB link base (plus headroom) so the two images
/// cannot collide.
pub const DYLD_SLIDE: u64 = 0x1_2000_0000;

/// Main-executable candidates tried when the command line names none.
const DEFAULT_EXECUTABLES: [&str; 2] = ["bin/zsh", "init"];

/// Kernel entry point, called by the boot trampoline once the CPU is in
/// long mode with low physical memory identity-mapped.
///
/// `magic` is the Multiboot magic left in EAX by the loader; `info_addr`
/// is the physical address of the Multiboot information structure.
#[no_mangle]
pub extern "C" fn kmain(magic: u32, info_addr: u64) -> ! {
    serial::init();
    logger::init(log::LevelFilter::Info);
    println!("quartz v{}", env!("CARGO_PKG_VERSION"));

    arch::x86_64::init();
    mm::init();

    let boot = match boot_info::read(magic, info_addr) {
        Ok(boot) => boot,
        Err(err) => fatal(format_args!("bad boot environment: {}", err)),
    };

    let cmdline = boot.cmdline().unwrap_or("");
    let cfg = config::parse_cmdline(cmdline);
    log::set_max_level(cfg.loglevel);
    log::info!("command line: {:?}", cmdline);

    fs::init();
    match boot.first_module() {
        Some(module) => fs::mount_ramdisk(module.start, module.len()),
        None => fatal(format_args!("no ramdisk module passed by the bootloader")),
    }
    drivers::init();

    let entry = match load_userspace(&cfg) {
        Ok(entry) => entry,
        Err(err) => fatal(format_args!("cannot start userspace: {}", err)),
    };

    log::info!("entering ring 3: rip={:#x} rsp={:#x}", entry.rip, entry.rsp);
    // SAFETY: `rip` is dyld's resolved entry inside segments we just mapped
    // user-executable, `rsp` points into the mapped user stack, and the GDT,
    // TSS, syscall MSRs, and kernel GS block were installed by
    // `arch::x86_64::init()`.
    unsafe { arch::x86_64::usermode::enter_usermode(entry.rip, entry.rsp) }
}

/// Initial ring-3 register state.
struct UserEntry {
    rip: u64,
    rsp: u64,
}

/// Load `dyld` and the main executable, build the user stack and commpage.
fn load_userspace(cfg: &BootConfig) -> Result<UserEntry, error::KernelError> {
    let dyld_data = fs::read_file("usr/lib/dyld").ok_or(error::KernelError::FileNotFound {
        path: "usr/lib/dyld",
    })?;
    let dyld = loader::load(dyld_data.as_slice(), DYLD_SLIDE)?;
    log::info!(
        "dyld: text_base={:#x} entry={:#x}",
        dyld.text_base,
        dyld.entry_point
    );

    let (path, main_data) = find_main_executable(cfg)?;
    // The main image is linked at its own base (with __PAGEZERO below it),
    // so it loads unslid.
    let main_image = loader::load(main_data.as_slice(), 0)?;
    log::info!("{}: text_base={:#x}", path, main_image.text_base);

    let rsp = darwin::stack::map_user_stack(main_image.text_base, path)?;
    darwin::commpage::map()?;

    Ok(UserEntry {
        rip: dyld.entry_point,
        rsp,
    })
}

/// Resolve the main executable: `init=` from the command line wins, then the
/// built-in candidates.
fn find_main_executable(
    cfg: &BootConfig,
) -> Result<(&'static str, fs::FileData), error::KernelError> {
    if let Some(path) = cfg.init {
        let path = fs::intern_path(path);
        return match fs::read_file(path) {
            Some(data) => Ok((path, data)),
            None => Err(error::KernelError::FileNotFound { path }),
        };
    }
    for path in DEFAULT_EXECUTABLES {
        if let Some(data) = fs::read_file(path) {
            return Ok((path, data));
        }
    }
    Err(error::KernelError::FileNotFound { path: "init" })
}

/// Print a boot-time diagnostic and park the CPU. There is nothing to
/// unwind to and no console beyond the serial port.
fn fatal(msg: core::fmt::Arguments) -> ! {
    println!("FATAL: {}", msg);
    arch::halt()
}
