mod cli;

use clap::Parser;
use cli::{Cli, Command};
use format40::collab::Collaborators;
use format40::diskmap::{DiskLocator, FixmapLabel};
use format40::io::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder};
use format40::layout::FixedLayout;
use format40::mkfs::{self, FormatOptions};
use format40::sb::{MasterSuper, SuperDescriptor};
use format40::status::{StatusBlock, StatusCode};
use format40::{Format40, KeyFormat, MountOptions};
use log::info;
use std::error::Error;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

type CliResult<T> = Result<T, Box<dyn Error>>;

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Format {
            image,
            blocks,
            block_size,
            label,
            short_keys,
        } => format(&image, blocks, block_size, &label, short_keys),
        Command::Inspect { image, block_size } => inspect(&image, block_size),
        Command::Check {
            image,
            block_size,
            options,
        } => check(&image, block_size, &options),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("f40: {}", e);
            ExitCode::from(2)
        }
    }
}

fn open(image: &Path, block_size: usize) -> CliResult<Arc<dyn BlockStorage>> {
    Ok(Arc::new(FileBlockEmulator::open(image, block_size)?))
}

fn format(image: &Path, blocks: u64, block_size: usize, label: &str, short_keys: bool) -> CliResult<bool> {
    let fd = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)?;
    let dev = FileBlockEmulatorBuilder::from(fd)
        .with_block_size(block_size)
        .with_block_count(blocks)
        .build()?;
    let keys = if short_keys {
        KeyFormat::Short
    } else {
        KeyFormat::Large
    };
    let sb = mkfs::format(
        &dev,
        &FormatOptions::new().with_label(label).with_key_format(keys),
    )?;
    println!(
        "{}: {} blocks of {} bytes, {} free",
        image.display(),
        sb.block_count,
        block_size,
        sb.free_blocks
    );
    Ok(true)
}

fn inspect(image: &Path, block_size: usize) -> CliResult<bool> {
    let dev = open(image, block_size)?;
    let layout = FixedLayout::for_block_size(block_size);
    let master = MasterSuper::parse(&dev.read_vec(layout.master)?)?;
    let label = String::from_utf8_lossy(&master.label);
    println!("master (block {})", layout.master);
    println!("  format:     {}", master.format_id);
    println!("  block size: {}", master.block_size);
    println!("  label:      {}", label.trim_end_matches('\0'));
    println!("  disk map:   {:?}", master.diskmap);

    let locator = match master.diskmap {
        Some(table) => DiskLocator::with_table(dev.clone(), table),
        None => DiskLocator::without_table(dev.clone()),
    };
    for entry in locator.entries()? {
        println!(
            "  relocation: label {} parameter {} -> block {}",
            entry.label, entry.parameter, entry.value
        );
    }

    let format_block = locator.resolve(FixmapLabel::Format, 0, layout.format)?;
    let sb = SuperDescriptor::parse(&dev.read_vec(format_block)?)?;
    println!("super (block {})", format_block);
    println!("  blocks:     {}", sb.block_count);
    println!("  free:       {}", sb.free_blocks);
    println!("  root:       {} (height {})", sb.root_block, sb.tree_height);
    println!("  next oid:   {}", sb.oid);
    println!("  files:      {}", sb.file_count);
    println!("  flushes:    {}", sb.flushes);
    println!("  keys:       {:?}", sb.key_format());

    let status_block = locator.resolve(FixmapLabel::Status, 0, layout.status)?;
    let status = StatusBlock::init(dev.clone(), status_block)?;
    let record = status.record();
    println!("status (block {})", status_block);
    println!("  status:     {:?}", StatusCode::from_raw(record.status));
    println!("  extended:   {:#x}", record.extended);
    if !record.message.is_empty() {
        println!("  message:    {}", record.message);
    }
    status.finish();
    Ok(true)
}

fn check(image: &Path, block_size: usize, options: &str) -> CliResult<bool> {
    let dev = open(image, block_size)?;
    let options = options
        .parse::<MountOptions>()?
        .read_only(true)
        .preload_bitmaps(true);
    let volume = Format40::mount(dev.clone(), options, Collaborators::standalone(dev))?;
    info!("status decision: {:?}", volume.status_decision());

    let recorded = volume.super_descriptor().free_blocks;
    let counted = volume.allocator().count_committed_free()?;
    let groups = volume.geometry().groups();
    volume.unmount();

    if recorded != counted {
        println!(
            "{}: super block records {} free blocks, bitmaps have {}",
            image.display(),
            recorded,
            counted
        );
        return Ok(false);
    }
    println!(
        "{}: {} groups clean, {} blocks free",
        image.display(),
        groups,
        counted
    );
    Ok(true)
}
