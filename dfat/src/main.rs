// SPDX-License-Identifier: MIT

#[macro_use]
mod ui;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use dfatfs::prelude::*;

const EXIT_USER: u8 = 1;
const EXIT_CORRUPT: u8 = 2;
const EXIT_IO: u8 = 3;

#[derive(Parser)]
#[command(name = "dfat", version, about = "FAT disk image defragmentation toolkit", long_about = None)]
struct Cli {
    /// Disk image path
    #[arg(short = 'f', long)]
    image: PathBuf,

    /// Journal file path (defaults to <image>.jrnl)
    #[arg(short, long)]
    journal: Option<PathBuf>,

    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, short)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect the volume without modifying it
    Info {
        /// List every directory and file
        #[arg(long)]
        contents: bool,

        /// Include hidden entries in the listing
        #[arg(long)]
        show_hidden: bool,

        /// Copy one file out of the image (path like /dir/file.txt)
        #[arg(long)]
        extract: Option<String>,

        /// FAT copy that wins when the copies disagree
        #[arg(long, default_value_t = 0)]
        default_table: u8,
    },
    /// Scatter file clusters to build fragmented test images
    Frag,
    /// Make every file contiguous
    Defrag {
        /// Only report the fragmentation level
        #[arg(long)]
        level: bool,
    },
    /// Inject structural defects for recovery testing
    Error {
        /// File recorded in only one FAT copy
        #[arg(long)]
        one_table: bool,

        /// File with a bad-cluster marker mid-chain
        #[arg(long)]
        bad_cluster: bool,

        /// File whose chain loops on itself
        #[arg(long)]
        self_loop: bool,

        /// Two files sharing a chain tail
        #[arg(long)]
        cross_link: bool,

        /// Allocated clusters no directory references
        #[arg(long)]
        lost_cluster: bool,
    },
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(if e.use_stderr() { EXIT_USER } else { 0 });
        }
    };

    ui::init(cli.quiet, cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("[dfat] error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn exit_code_for(e: &FsError) -> u8 {
    if e.is_corruption() {
        EXIT_CORRUPT
    } else if e.is_io() {
        EXIT_IO
    } else {
        EXIT_USER
    }
}

fn run(cli: Cli) -> FsResult<()> {
    let opts = OpenOptions {
        preferred_fat: match &cli.command {
            Commands::Info { default_table, .. } => *default_table,
            _ => 0,
        },
        journal_path: cli.journal.clone(),
    };

    let mut vol = Volume::open_with(&cli.image, opts)?;
    let replay = vol.replay_summary();
    if replay.replayed > 0 || replay.discarded > 0 {
        status!(
            "journal replay: {} transaction(s) finished, {} record(s) discarded",
            replay.replayed,
            replay.discarded
        );
    }
    for note in vol.notes() {
        status!("{note}");
    }

    match cli.command {
        Commands::Info {
            contents,
            show_hidden,
            extract,
            ..
        } => {
            print_info(&mut vol)?;
            if contents {
                print_tree(&vol, show_hidden);
            }
            if let Some(path) = extract {
                extract_file(&mut vol, &path)?;
            }
        }
        Commands::Frag => {
            let moved = Fragmenter::new(&mut vol).run()?;
            report!("scattered {moved} cluster(s)");
        }
        Commands::Defrag { level } => {
            if level {
                let level = Defragmenter::new(&mut vol).fragmentation_level();
                report!("fragmentation level: {level:.1}%");
            } else {
                let report = Defragmenter::new(&mut vol).run()?;
                report!(
                    "{} file(s) relocated, {} cluster move(s), {} already contiguous",
                    report.files_moved,
                    report.clusters_moved,
                    report.already_contiguous
                );
                for path in &report.no_space {
                    report!("no contiguous space for {path}");
                }
                for (path, err) in &report.damaged {
                    report!("skipped damaged {path}: {err}");
                }
            }
        }
        Commands::Error {
            one_table,
            bad_cluster,
            self_loop,
            cross_link,
            lost_cluster,
        } => {
            let mut injector = FaultInjector::new(&mut vol);
            if one_table {
                injector.file_in_one_fat(0)?;
                report!("created a file recorded in FAT copy 0 only");
            }
            if bad_cluster {
                let (_, c) = injector.file_with_bad_cluster()?;
                report!("created a file with bad cluster {c}");
            }
            if self_loop {
                let (_, c) = injector.file_with_self_loop()?;
                report!("created a file looping at cluster {c}");
            }
            if cross_link {
                let (_, _, c) = injector.cross_linked_files()?;
                report!("created two files cross-linked at cluster {c}");
            }
            if lost_cluster {
                let start = injector.lost_cluster_run(2)?;
                report!("created a lost cluster run at {start}");
            }
        }
    }

    vol.close()?;
    Ok(())
}

fn print_info(vol: &mut Volume<FileBlockIO>) -> FsResult<()> {
    let info = vol.info()?;
    report!("filesystem: {}", info.variant.name());
    report!("fat copies: {}", info.num_fats);
    report!("files: {}", info.file_count);
    report!("directories: {}", info.dir_count);
    report!(
        "clusters: {} x {} bytes ({} free)",
        info.cluster_count,
        info.bytes_per_cluster,
        info.free_clusters
    );
    report!(
        "capacity: {} bytes, used: {} bytes, free: {} bytes",
        info.capacity_bytes,
        info.capacity_bytes - info.free_bytes,
        info.free_bytes
    );
    if let Some(hint) = info.fsinfo_free_hint {
        detail!("fsinfo free-cluster hint: {hint}");
    }
    Ok(())
}

fn print_tree(vol: &Volume<FileBlockIO>, show_hidden: bool) {
    report!("contents:");
    print_tree_level(vol, ROOT_ID, 0, show_hidden);
}

fn print_tree_level(vol: &Volume<FileBlockIO>, dir: FileId, depth: usize, show_hidden: bool) {
    for id in vol.catalog().children(dir) {
        let node = vol.catalog().node(id);
        if !show_hidden && FileAttributes::is_hidden(node.attr) {
            continue;
        }
        let marker = if node.is_dir { ":" } else { "" };
        let damaged = match node.chain_error {
            Some(e) => format!("  [damaged: {e}]"),
            None => String::new(),
        };
        report!("{}{}{}{}", "\t".repeat(depth), node.name, marker, damaged);
        if node.is_dir && node.chain_error.is_none() {
            print_tree_level(vol, id, depth + 1, show_hidden);
        }
    }
}

fn extract_file(vol: &mut Volume<FileBlockIO>, path: &str) -> FsResult<()> {
    let id = vol.find_path(path).ok_or(FsError::NotFound)?;
    if vol.catalog().node(id).is_dir {
        return Err(FsError::Unsupported("Cannot extract a directory"));
    }
    let data = vol.read_file(id)?;
    let target = path.rsplit(['/', '\\']).next().unwrap_or("extracted");
    std::fs::write(target, &data)
        .map_err(|_| FsError::IO(BlockIOError::Io("could not write the extracted file")))?;
    report!("extracted {} byte(s) to {target}", data.len());
    Ok(())
}
