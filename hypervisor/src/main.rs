//! A UEFI hypervisor kernel that materializes guest executables from a
//! persistent module database, links them in memory, and supervises them
//! as hardware-virtualized guests on Intel VT-x and AMD-V processors.
#![no_main]
#![no_std]
#![warn(
    // groups: https://doc.rust-lang.org/rustc/lints/groups.html
    future_incompatible,
    let_underscore,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    rust_2024_compatibility,
    unused,

    // warnings that are not enabled by default or covered by groups
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    noop_method_call,
    single_use_lifetimes,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_crate_dependencies,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,

    // https://github.com/rust-lang/rust-clippy/blob/master/README.md
    clippy::pedantic,
    clippy::cargo,

    // https://doc.rust-lang.org/rustdoc/lints.html
    rustdoc::missing_crate_level_docs,
    rustdoc::private_doc_tests,
    rustdoc::invalid_html_tags,
)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

extern crate alloc;

mod allocator;
mod config;
mod deploy;
mod disk;
mod frame;
mod hardware_vt;
mod hypervisor;
mod ipc;
mod logger;
mod panic;
mod system_table;
mod vm;
mod x86_instructions;

use crate::{
    config::{DEMO_ENTRY_POINT, MODULE_DB_PATH},
    disk::{BootBlockIo, FileBlockIo},
    logger::init_uart_logger,
    system_table::{init_system_table, system_table, system_table_unsafe},
};
use core::ffi::c_void;
use log::{error, info, warn};
use stonelink::db::{io::MemoryBlockIo, Db};
use uefi::{
    prelude::*,
    proto::{loaded_image::LoadedImage, pi::mp::MpServices},
    table::boot::{OpenProtocolAttributes, OpenProtocolParams},
};
use x86::current::paging::BASE_PAGE_SHIFT;

/// The entry point of the kernel.
#[no_mangle]
extern "efiapi" fn efi_main(image: Handle, system_table: SystemTable<Boot>) -> Status {
    init_uart_logger();
    info!("stonevisor loaded");

    init_system_table(system_table, image);
    print_image_info();

    // The module database: the on-disk store when the boot volume has one,
    // otherwise an in-memory store seeded with the demonstration modules.
    let db = match open_module_database() {
        Ok(db) => db,
        Err(err) => {
            error!("cannot open the module database: {err:?}");
            return Status::LOAD_ERROR;
        }
    };

    if let Err(err) = hypervisor::init(db) {
        error!("hypervisor initialization failed: {err:?}");
        return Status::UNSUPPORTED;
    }

    run_vms_on_all_processors()
}

/// Opens or seeds the module database.
fn open_module_database() -> Result<Db<BootBlockIo>, stonelink::db::DbError> {
    match FileBlockIo::open(MODULE_DB_PATH) {
        Ok(io) => {
            info!("using the on-disk module database {MODULE_DB_PATH:?}");
            Db::open_or_create(BootBlockIo::File(io))
        }
        Err(err) => {
            warn!("no usable {MODULE_DB_PATH:?} ({err:?}); seeding the demonstration set");
            let mut db = Db::open_or_create(BootBlockIo::Memory(MemoryBlockIo::new()))?;
            deploy::demo_manifest().ingest(&mut db)?;
            Ok(db)
        }
    }
}

/// Runs one VM per logical processor: the demonstration guest on the boot
/// processor, and the same program independently on every application
/// processor.
fn run_vms_on_all_processors() -> Status {
    // Safety: code is single threaded at this point.
    let st = unsafe { system_table_unsafe() };
    let bs = st.boot_services();
    let multi_processor = bs
        .get_handle_for_protocol::<MpServices>()
        .ok()
        .and_then(|handle| {
            unsafe {
                bs.open_protocol::<MpServices>(
                    OpenProtocolParams {
                        handle,
                        agent: bs.image_handle(),
                        controller: None,
                    },
                    OpenProtocolAttributes::GetProtocol,
                )
            }
            .ok()
        });

    if let Some(mp) = &multi_processor {
        let processor_count = mp.get_number_of_processors().map(|count| count.enabled);
        info!("processors: {processor_count:?}");
        // Non-blocking startup is unavailable this early, so application
        // processors each run their guest to completion before the call
        // returns.
        if let Err(err) =
            mp.startup_all_aps(false, run_demo_vm_on_ap, core::ptr::null_mut(), None)
        {
            warn!("application processors not started: {err:?}");
        }
    }

    match hypervisor::vm_create(DEMO_ENTRY_POINT) {
        Ok(summary) => {
            let output = summary.registers.rbx;
            info!("demonstration guest finished; RBX={output:#x}");
            Status::SUCCESS
        }
        Err(err) => {
            error!("cannot run the demonstration guest: {err:?}");
            Status::ABORTED
        }
    }
}

/// Wraps the per-processor VM run for the MP services callback.
extern "efiapi" fn run_demo_vm_on_ap(_context: *mut c_void) {
    match hypervisor::vm_create(DEMO_ENTRY_POINT) {
        Ok(summary) => info!("AP guest finished; RBX={:#x}", summary.registers.rbx),
        Err(err) => error!("AP guest failed: {err:?}"),
    }
}

/// Debug prints the address of this image.
fn print_image_info() {
    let st = system_table();
    let bs = st.boot_services();
    // Safety: the protocol and handle remain valid indefinitely.
    let loaded_image = unsafe {
        bs.open_protocol::<LoadedImage>(
            OpenProtocolParams {
                handle: bs.image_handle(),
                agent: bs.image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
        .unwrap()
    };
    let (image_base, image_size) = loaded_image.info();
    info!(
        "stonevisor image range {:#x} - {:#x}",
        image_base as u64,
        image_base as u64 + image_size
    );
}

/// Computes how many pages are needed for the given bytes.
fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}
