#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use asupersync::Cx;
use gcfs::{
    CloseReport, EvictOutcome, Filesystem, FsStatus, INCOMPAT_EXTENT_TREE_V2, InodeNumber,
    JOURNAL_FILE_NAME, MountOptions, SubvolumeId,
};
use serde::Serialize;
use std::env;
use std::path::{Path, PathBuf};

// ── Production Cx acquisition ───────────────────────────────────────────────

/// Create a production `Cx` for CLI commands.
fn cli_cx() -> Cx {
    Cx::for_request()
}

#[derive(Debug, Serialize)]
struct EvictOutput {
    subvol: u64,
    ino: u64,
    outcome: EvictOutcome,
}

fn main() {
    if let Err(error) = run(env::args().skip(1).collect()) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run(mut args: Vec<String>) -> Result<()> {
    let config = take_option(&mut args, "--config")?.map(PathBuf::from);
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "format" => {
            let mut rest = rest;
            let roots = take_option(&mut rest, "--roots")?;
            let legacy = take_flag(&mut rest, "--no-extended-reclaim");
            let [dir] = positional::<1>(&rest, "format <dir>")?;
            let mut options = load_options(config.as_deref(), Path::new(dir))?;
            if let Some(roots) = roots {
                options.nr_global_roots = roots
                    .parse()
                    .with_context(|| format!("invalid --roots value: {roots}"))?;
            }
            if legacy {
                options.incompat_flags &= !INCOMPAT_EXTENT_TREE_V2;
            }
            format(options)
        }
        "mksubvol" => {
            let [dir, subvol] = positional::<2>(&rest, "mksubvol <dir> <subvol>")?;
            let fs = open(config.as_deref(), Path::new(dir))?;
            let id = SubvolumeId(parse_u64(subvol, "subvol")?);
            fs.create_subvolume(id)
                .with_context(|| format!("failed to create subvolume {id}"))?;
            println!("subvolume {id} created");
            Ok(())
        }
        "rmsubvol" => {
            let [dir, subvol] = positional::<2>(&rest, "rmsubvol <dir> <subvol>")?;
            let fs = open(config.as_deref(), Path::new(dir))?;
            let id = SubvolumeId(parse_u64(subvol, "subvol")?);
            fs.delete_subvolume(id)
                .with_context(|| format!("failed to delete subvolume {id}"))?;
            println!("subvolume {id} deleted");
            Ok(())
        }
        "mkfile" => {
            let [dir, subvol, ino, extents] =
                positional::<4>(&rest, "mkfile <dir> <subvol> <ino> <extents>")?;
            let fs = open(config.as_deref(), Path::new(dir))?;
            let subvol = SubvolumeId(parse_u64(subvol, "subvol")?);
            let ino = InodeNumber(parse_u64(ino, "ino")?);
            let extents = parse_u64(extents, "extents")?;
            fs.create_inode(subvol, ino, extents)
                .with_context(|| format!("failed to create inode {ino} in subvolume {subvol}"))?;
            println!("inode {ino} created in subvolume {subvol} with {extents} extents");
            Ok(())
        }
        "evict" => {
            let mut rest = rest;
            let json = take_flag(&mut rest, "--json");
            let [dir, subvol, ino] = positional::<3>(&rest, "evict <dir> <subvol> <ino>")?;
            let fs = open(config.as_deref(), Path::new(dir))?;
            let subvol = SubvolumeId(parse_u64(subvol, "subvol")?);
            let ino = InodeNumber(parse_u64(ino, "ino")?);
            let outcome = fs
                .evict_inode(subvol, ino)
                .with_context(|| format!("failed to evict inode {ino} in subvolume {subvol}"))?;
            let output = EvictOutput {
                subvol: subvol.0,
                ino: ino.0,
                outcome,
            };
            if json {
                print_json(&output)
            } else {
                println!("inode {ino} in subvolume {subvol}: {outcome:?}");
                Ok(())
            }
        }
        "status" => {
            let mut rest = rest;
            let json = take_flag(&mut rest, "--json");
            let [dir] = positional::<1>(&rest, "status <dir>")?;
            let fs = open(config.as_deref(), Path::new(dir))?;
            let status = fs.status();
            if json {
                print_json(&status)
            } else {
                print_status(&status);
                Ok(())
            }
        }
        "unmount" => {
            let mut rest = rest;
            let json = take_flag(&mut rest, "--json");
            let [dir] = positional::<1>(&rest, "unmount <dir>")?;
            let fs = open(config.as_deref(), Path::new(dir))?;
            let report = fs.close().context("unmount failed")?;
            if json {
                print_json(&report)
            } else {
                print_close(&report);
                Ok(())
            }
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("gcfs-cli\n");
    println!("USAGE:");
    println!("  gcfs-cli [--config <file.json>] <command> ...\n");
    println!("COMMANDS:");
    println!("  format <dir> [--roots N] [--no-extended-reclaim]");
    println!("  mksubvol <dir> <subvol>");
    println!("  rmsubvol <dir> <subvol>");
    println!("  mkfile <dir> <subvol> <ino> <extents>");
    println!("  evict <dir> <subvol> <ino> [--json]");
    println!("  status <dir> [--json]");
    println!("  unmount <dir> [--json]");
}

// ── Argument helpers ────────────────────────────────────────────────────────

/// Remove `--name <value>` from `args`.
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("{name} requires a value");
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn take_flag(args: &mut Vec<String>, name: &str) -> bool {
    let before = args.len();
    args.retain(|a| a != name);
    args.len() != before
}

fn positional<'a, const N: usize>(args: &'a [String], usage: &str) -> Result<[&'a str; N]> {
    if let Some(extra) = args.iter().find(|a| a.starts_with("--")) {
        bail!("unknown option {extra}; usage: {usage}");
    }
    if args.len() != N {
        bail!("usage: {usage}");
    }
    Ok(std::array::from_fn(|i| args[i].as_str()))
}

fn parse_u64(value: &str, what: &str) -> Result<u64> {
    value
        .parse()
        .with_context(|| format!("invalid {what}: {value}"))
}

// ── Mounting ────────────────────────────────────────────────────────────────

/// Mount options for `dir`: the JSON config if given, otherwise manual
/// reclaim workers so every command is deterministic.
fn load_options(config: Option<&Path>, dir: &Path) -> Result<MountOptions> {
    let options = match config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<MountOptions>(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => MountOptions::in_memory(),
    };
    Ok(options.with_journal_dir(dir))
}

fn format(options: MountOptions) -> Result<()> {
    let Some(dir) = options.journal_dir.clone() else {
        bail!("format requires a directory");
    };
    if dir.join(JOURNAL_FILE_NAME).exists() {
        bail!("{} already holds a filesystem", dir.display());
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    let fs = Filesystem::mount(&cli_cx(), options)
        .with_context(|| format!("failed to format {}", dir.display()))?;
    let geometry = fs.status().geometry;
    println!(
        "formatted {} (roots={}, nodesize={}, incompat={:#x})",
        dir.display(),
        geometry.nr_global_roots,
        geometry.nodesize,
        geometry.incompat_flags
    );
    Ok(())
}

fn open(config: Option<&Path>, dir: &Path) -> Result<Filesystem> {
    if !dir.join(JOURNAL_FILE_NAME).exists() {
        bail!("{} holds no filesystem; run format first", dir.display());
    }
    let options = load_options(config, dir)?;
    Filesystem::mount(&cli_cx(), options)
        .with_context(|| format!("failed to mount {}", dir.display()))
}

// ── Output ──────────────────────────────────────────────────────────────────

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

fn print_status(status: &FsStatus) {
    println!("gcfs status");
    println!("closing: {:?}", status.closing);
    println!("gc_roots: {}", status.geometry.nr_global_roots);
    println!("nodesize: {}", status.geometry.nodesize);
    println!("incompat: {:#x}", status.geometry.incompat_flags);
    println!("subvolumes: {:?}", status.subvolumes);
    println!("pending_gc_items: {}", status.pending_gc_items);
    for (index, pending) in status.pending_per_root.iter().enumerate() {
        if *pending > 0 {
            println!("  root {index}: {pending}");
        }
    }
    println!("replayed_commits: {}", status.replayed_commits);
    if status.discarded_records > 0 {
        println!("discarded_records: {}", status.discarded_records);
    }
    println!(
        "space: free={} reserved={} pinned={}",
        status.space.free, status.space.reserved, status.space.pinned
    );
}

fn print_close(report: &CloseReport) {
    println!("unmounted");
    println!("workers_queued: {}", report.dispatch.queued);
    println!("items_reclaimed: {}", report.gc.items_reclaimed);
    println!("missing_subvolumes: {}", report.gc.missing_subvolumes);
    println!("truncate_retries: {}", report.gc.truncate_retries);
    println!("final_drain: {}", report.final_drain);
    println!("remaining: {}", report.remaining);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_owned()).collect()
    }

    fn cmd(list: &[&str]) -> Result<()> {
        run(args(list))
    }

    #[test]
    fn take_option_removes_name_and_value() {
        let mut a = args(&["status", "--config", "c.json", "/tmp/x"]);
        assert_eq!(
            take_option(&mut a, "--config").expect("option"),
            Some("c.json".to_owned())
        );
        assert_eq!(a, args(&["status", "/tmp/x"]));
        let mut dangling = args(&["--roots"]);
        assert!(take_option(&mut dangling, "--roots").is_err());
    }

    #[test]
    fn positional_rejects_unknown_options() {
        let a = args(&["/tmp/x", "--bogus"]);
        assert!(positional::<1>(&a, "status <dir>").is_err());
        let a = args(&["/tmp/x"]);
        assert_eq!(positional::<1>(&a, "status <dir>").expect("dir"), ["/tmp/x"]);
    }

    #[test]
    fn evict_then_unmount_reclaims_across_invocations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = dir.path().to_str().expect("utf-8 path");
        cmd(&["format", d, "--roots", "16"]).expect("format");
        assert!(cmd(&["format", d]).is_err());
        cmd(&["mksubvol", d, "7"]).expect("mksubvol");
        cmd(&["mkfile", d, "7", "42", "5"]).expect("mkfile");
        cmd(&["evict", d, "7", "42"]).expect("evict");

        let fs = open(None, dir.path()).expect("open");
        let status = fs.status();
        assert_eq!(status.pending_per_root[10], 1);
        drop(fs);

        cmd(&["unmount", d, "--json"]).expect("unmount");
        let fs = open(None, dir.path()).expect("open");
        assert_eq!(fs.pending_gc_items(), 0);
        assert_eq!(
            fs.inode_item_count(SubvolumeId(7), InodeNumber(42))
                .expect("count"),
            0
        );
    }

    #[test]
    fn config_file_and_legacy_format_apply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("options.json");
        std::fs::write(&config, r#"{"nr_global_roots": 4, "gc_workers": 0}"#).expect("write");
        let fsdir = dir.path().join("fs");
        let d = fsdir.to_str().expect("utf-8 path");
        let c = config.to_str().expect("utf-8 path");

        cmd(&["--config", c, "format", d, "--no-extended-reclaim"]).expect("format");
        let fs = open(None, &fsdir).expect("open");
        let geometry = fs.status().geometry;
        assert_eq!(geometry.nr_global_roots, 4);
        assert_eq!(geometry.incompat_flags, 0);
        drop(fs);

        cmd(&["mkfile", d, "5", "300", "2"]).expect("mkfile");
        let fs = open(None, &fsdir).expect("open");
        assert_eq!(
            fs.evict_inode(SubvolumeId::TOP_LEVEL, InodeNumber(300))
                .expect("evict"),
            EvictOutcome::ReclaimedInline
        );
    }

    #[test]
    fn commands_on_unformatted_dir_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let d = dir.path().to_str().expect("utf-8 path");
        assert!(cmd(&["status", d]).is_err());
        assert!(cmd(&["frobnicate"]).is_err());
        cmd(&[]).expect("usage");
    }
}
