use aimeta::database::Database;
use aimeta::error::Result;
use aimeta::paths::RepoRoot;
use aimeta::{exif, ingest, resolve};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "aimeta", about = "Image generation metadata pipeline", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run ExifTool over the input directory and append new raw records
    Exif(ExifArgs),
    /// Normalize raw ExifTool records into the DB and exports
    Ingest(IngestArgs),
    /// Rebuild per-image resources from stored workflows
    Resources(ResourcesArgs),
    /// Import model version maps and rewrite resource references
    Resolve(ResolveArgs),
    /// Exif, ingest and resources in one go
    All(AllArgs),
}

#[derive(Args)]
struct ExifArgs {
    /// Directory of images, relative to the repo root
    #[arg(long, default_value = "Input")]
    input: String,
    /// Raw ExifTool JSONL output path
    #[arg(long, default_value = "out/exif_raw.jsonl")]
    out: String,
    /// ExifTool executable name or path
    #[arg(long, default_value = "exiftool")]
    exiftool: String,
}

#[derive(Args)]
struct IngestArgs {
    /// Raw ExifTool JSONL to read
    #[arg(long = "in", default_value = "out/exif_raw.jsonl")]
    in_jsonl: String,
    #[arg(long, default_value = "out/images.db")]
    db: String,
    /// Merged JSONL export path
    #[arg(long, default_value = "out/records.jsonl")]
    jsonl: String,
    /// Merged CSV export path
    #[arg(long, default_value = "out/records.csv")]
    csv: String,
}

#[derive(Args)]
struct ResourcesArgs {
    #[arg(long, default_value = "out/images.db")]
    db: String,
    /// Stop after this many workflow rows (0 means all)
    #[arg(long, default_value_t = 0)]
    limit: usize,
}

#[derive(Args)]
struct ResolveArgs {
    #[arg(long, default_value = "out/images.db")]
    db: String,
    /// Civitai-style export dump (JSON) to import model versions from
    #[arg(long)]
    import_json: Option<String>,
    /// Manual model version map (JSON or CSV) to import
    #[arg(long)]
    import_map: Option<String>,
    /// Rewrite resource_ref rows using the imported model versions
    #[arg(long)]
    rewrite: bool,
}

#[derive(Args)]
struct AllArgs {
    #[arg(long, default_value = "Input")]
    input: String,
    #[arg(long, default_value = "exiftool")]
    exiftool: String,
    #[arg(long, default_value = "out/exif_raw.jsonl")]
    raw: String,
    #[arg(long, default_value = "out/images.db")]
    db: String,
    #[arg(long, default_value = "out/records.jsonl")]
    jsonl: String,
    #[arg(long, default_value = "out/records.csv")]
    csv: String,
}

fn open_db(root: &RepoRoot, raw: &str) -> Result<Database> {
    let db_path = root.resolve(raw, false, false)?;
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Database::new(&db_path)
}

fn out_path(root: &RepoRoot, raw: &str) -> Result<PathBuf> {
    root.resolve(raw, false, false)
}

fn cmd_exif(root: &RepoRoot, args: &ExifArgs) -> Result<()> {
    let input_dir = root.resolve(&args.input, true, false)?;
    let out_jsonl = out_path(root, &args.out)?;

    if !exif::has_any_file(&input_dir) {
        println!("No files under {}, nothing to scan.", input_dir.display());
        if let Some(parent) = out_jsonl.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !out_jsonl.exists() {
            std::fs::write(&out_jsonl, b"")?;
        }
        return Ok(());
    }

    let items = exif::run_exiftool(&args.exiftool, &input_dir)?;
    let appended = exif::append_new_jsonl(&items, &out_jsonl)?;
    println!(
        "Appended {appended} new record(s) to {} ({} scanned).",
        out_jsonl.display(),
        items.len()
    );
    Ok(())
}

fn cmd_ingest(root: &RepoRoot, args: &IngestArgs) -> Result<()> {
    let db = open_db(root, &args.db)?;
    let in_jsonl = root.resolve(&args.in_jsonl, true, false)?;
    let out_jsonl = out_path(root, &args.jsonl)?;
    let out_csv = out_path(root, &args.csv)?;

    let summary = ingest::run_ingest(&db, root, &in_jsonl, &out_jsonl, &out_csv)?;
    println!(
        "Done. Ingested {} record(s); exports hold {} record(s).",
        summary.records_in, summary.records_out
    );
    Ok(())
}

fn cmd_resources(root: &RepoRoot, args: &ResourcesArgs) -> Result<()> {
    let db = open_db(root, &args.db)?;
    let summary = ingest::run_resources_pass(&db, args.limit)?;
    println!("workflow_json rows found: {}", summary.workflow_rows);
    println!("Images updated: {}", summary.images_updated);
    println!("Resources inserted: {}", summary.resources_inserted);
    Ok(())
}

fn cmd_resolve(root: &RepoRoot, args: &ResolveArgs) -> Result<()> {
    let db = open_db(root, &args.db)?;
    let mut did_anything = false;

    if let Some(raw) = &args.import_json {
        let path = root.resolve(raw, true, true)?;
        let imported = resolve::import_export_dump(&db, &path)?;
        println!("Imported {imported} model version(s) from {}", path.display());
        did_anything = true;
    }
    if let Some(raw) = &args.import_map {
        let path = root.resolve(raw, true, true)?;
        let imported = resolve::import_manual_map(&db, &path)?;
        println!("Imported {imported} model version(s) from {}", path.display());
        did_anything = true;
    }
    if args.rewrite {
        let (scanned, rewritten) = resolve::rewrite_resources(&db)?;
        println!("resource_ref rows scanned: {scanned}, rewritten: {rewritten}");
        did_anything = true;
    }
    if !did_anything {
        println!("Nothing to do. Pass --import-json, --import-map and/or --rewrite.");
    }
    Ok(())
}

fn cmd_all(root: &RepoRoot, args: &AllArgs) -> Result<()> {
    cmd_exif(
        root,
        &ExifArgs {
            input: args.input.clone(),
            out: args.raw.clone(),
            exiftool: args.exiftool.clone(),
        },
    )?;
    cmd_ingest(
        root,
        &IngestArgs {
            in_jsonl: args.raw.clone(),
            db: args.db.clone(),
            jsonl: args.jsonl.clone(),
            csv: args.csv.clone(),
        },
    )?;
    cmd_resources(
        root,
        &ResourcesArgs {
            db: args.db.clone(),
            limit: 0,
        },
    )
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir()?;
    let root = RepoRoot::new(&cwd)?;

    match &cli.command {
        Command::Exif(args) => cmd_exif(&root, args),
        Command::Ingest(args) => cmd_ingest(&root, args),
        Command::Resources(args) => cmd_resources(&root, args),
        Command::Resolve(args) => cmd_resolve(&root, args),
        Command::All(args) => cmd_all(&root, args),
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
