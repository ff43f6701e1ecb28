use format40::alloc::AllocRequest;
use format40::collab::Collaborators;
use format40::io::{BlockStorage, FileBlockEmulatorBuilder};
use format40::mkfs::{self, FormatOptions};
use format40::txn::Atom;
use format40::{Format40, MountOptions};
use std::sync::Arc;

pub fn main() {
    env_logger::init();

    let tmp = tempfile::tempfile().unwrap();
    let dev: Arc<dyn BlockStorage> = Arc::new(
        FileBlockEmulatorBuilder::from(tmp)
            .with_block_count(4096)
            .build()
            .expect("Could not initialize disk emulator."),
    );
    mkfs::format(&*dev, &FormatOptions::new().with_label("demo")).expect("should format");

    let options: MountOptions = "preload".parse().unwrap();
    let mut volume = Format40::mount(dev.clone(), options, Collaborators::standalone(dev.clone()))
        .expect("should mount");

    let mut atom = Atom::new();
    let range = volume
        .allocate(&mut atom, &AllocRequest::forward(1000).with_len(16, 128))
        .unwrap();
    let touched = volume.commit(atom).unwrap();
    println!(
        "allocated {:?}, {} bitmap groups written, {} blocks free",
        range,
        touched.len(),
        volume.allocator().committed_free_blocks()
    );
    volume.unmount();
}
