use std::{error::Error, fs::File, path::PathBuf};

use memmap2::Mmap;
use vmsnap::{
    ImageLoader, MemoryLayout, Pa, SnapCore,
    arch::aarch64::Aarch64,
    os::linux::{LinuxScanner, Profile},
};

/// Size of the chunks fed to the loader.
const CHUNK_SIZE: usize = 16 << 20;

pub struct Args {
    pub snapshot: PathBuf,
    pub profile: Option<String>,
    pub kernel_root: Option<Pa>,
}

/// Parses `<snapshot> [profile name | profile.json] [kernel root]`.
pub fn parse_args() -> Result<Args, Box<dyn Error>> {
    let mut args = std::env::args().skip(1);

    let snapshot = match args.next() {
        Some(snapshot) => PathBuf::from(snapshot),
        None => return Err("usage: <snapshot> [profile] [kernel-root]".into()),
    };

    let profile = args.next().filter(|profile| profile != "-");

    let kernel_root = match args.next() {
        Some(root) => Some(Pa(u64::from_str_radix(root.trim_start_matches("0x"), 16)?)),
        None => None,
    };

    Ok(Args {
        snapshot,
        profile,
        kernel_root,
    })
}

pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();
}

/// Loads a raw physical memory snapshot.
pub fn open_snapshot(args: &Args) -> Result<SnapCore<Aarch64>, Box<dyn Error>> {
    let file = File::open(&args.snapshot)?;

    // The snapshot is only read, and only while it is being copied into the
    // image.
    let mmap = unsafe { Mmap::map(&file)? };

    tracing::info!(path = %args.snapshot.display(), size = mmap.len(), "loading snapshot");

    let mut loader = ImageLoader::new(mmap.len() as u64).with_progress(
        ImageLoader::DEFAULT_PROGRESS_INTERVAL,
        |progress| {
            tracing::info!(
                pages = progress.pages,
                fraction = progress.fraction(),
                "loading"
            );
        },
    );

    for chunk in mmap.chunks(CHUNK_SIZE) {
        loader.push(chunk)?;
    }

    let image = loader.finish()?;
    tracing::info!(loaded_pages = image.loaded_pages(), "snapshot loaded");

    Ok(SnapCore::new(image, MemoryLayout::default()))
}

/// Creates a scanner with the requested profile.
///
/// Without a profile, the built-in profiles are tried in turn and the first
/// one that finds `init_task` wins.
pub fn create_scanner<'a>(
    core: &'a SnapCore<Aarch64>,
    args: &Args,
) -> Result<LinuxScanner<'a, Aarch64>, Box<dyn Error>> {
    let profile = match &args.profile {
        Some(path) if path.ends_with(".json") => {
            Profile::from_json(&std::fs::read_to_string(path)?)?
        }
        Some(name) => Profile::by_name(name)?,
        None => {
            let found = Profile::BUILTIN
                .iter()
                .filter_map(|name| Profile::by_name(name).ok())
                .find(|profile| {
                    LinuxScanner::new(core, profile.clone())
                        .find_init_task()
                        .is_some()
                });

            match found {
                Some(profile) => profile,
                None => return Err("no built-in profile matches the snapshot".into()),
            }
        }
    };

    tracing::info!(profile = %profile.name, "profile selected");

    let scanner = LinuxScanner::new(core, profile);
    Ok(match args.kernel_root {
        Some(root) => scanner.with_kernel_root(root),
        None => scanner,
    })
}
