//! vmtsig CLI - verifies vtable method signatures against PE images on disk.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytesize::ByteSize;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vmtsig::disasm;
use vmtsig::verifier::MethodStatus;
use vmtsig::{
    apply_steps, find_vmts, scan_section_all, Pattern, PeImage, ProgressInfo, ProgressStage,
    SignatureDocument, Step, Verifier, VerifyConfig, VerifyReport,
};

/// Recover MSVC vtables from PE images and resolve signatures to method ordinals.
#[derive(Parser)]
#[command(name = "vmtsig")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve every signature in a signature document and write the ordinals
    Verify {
        /// Directory the document's folder keys are relative to
        root: PathBuf,

        /// Signature document
        #[arg(short, long, default_value = "vmt_signatures.json")]
        signatures: PathBuf,

        /// Output file for the class -> method -> ordinal map
        #[arg(short, long, default_value = "vmt.json")]
        output: PathBuf,

        /// Section to scan for signatures
        #[arg(long, default_value = ".text")]
        section: String,

        /// Flag signatures that match more than once
        #[arg(long)]
        ambiguous: bool,

        /// Exit with an error if anything was left unresolved
        #[arg(long)]
        strict: bool,
    },

    /// List the primary vtables recovered from an image
    Vmts {
        /// PE image to inspect
        image: PathBuf,

        /// Only show classes whose name contains this string
        #[arg(short, long)]
        filter: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Scan an image for a single pattern
    Scan {
        /// PE image to scan
        image: PathBuf,

        /// Combo string, e.g. "48 8B 05 ? ? ? ? C3"
        pattern: String,

        /// Section to scan
        #[arg(long, default_value = ".text")]
        section: String,

        /// Resolution step as KIND,OPERAND (repeatable)
        #[arg(long = "step")]
        steps: Vec<Step>,

        /// Report every match instead of only the first
        #[arg(long)]
        all: bool,

        /// Look the resolved function up in this class's vtable
        #[arg(short, long)]
        class: Option<String>,

        /// Instructions to disassemble at each result
        #[arg(long, default_value = "5")]
        preview: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    match cli.command {
        Commands::Verify {
            root,
            signatures,
            output,
            section,
            ambiguous,
            strict,
        } => {
            verify(&root, &signatures, &output, section, ambiguous, strict)?;
        }

        Commands::Vmts {
            image,
            filter,
            json,
        } => {
            list_vmts(&image, filter.as_deref(), json)?;
        }

        Commands::Scan {
            image,
            pattern,
            section,
            steps,
            all,
            class,
            preview,
        } => {
            scan(&image, &pattern, &section, &steps, all, class.as_deref(), preview)?;
        }
    }

    Ok(())
}

fn print_header(text: &str) {
    let rule = "=".repeat(text.len());
    println!("{rule}\n{text}\n{rule}");
}

fn verify(
    root: &Path,
    signatures: &Path,
    output: &Path,
    section: String,
    ambiguous: bool,
    strict: bool,
) -> anyhow::Result<()> {
    let document = SignatureDocument::load(signatures)
        .with_context(|| format!("could not open {}", signatures.display()))?;

    let pb = ProgressBar::new(document.module_count() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let pb_clone = pb.clone();
    let config = VerifyConfig {
        root: root.to_path_buf(),
        code_section: section,
        report_ambiguous: ambiguous,
        progress_callback: Some(Box::new(move |info: &ProgressInfo| {
            let item = info.current_item.as_deref().unwrap_or("");
            let msg = match info.stage {
                ProgressStage::RecoveringVtables => format!(
                    "{} - {} ({}, {} vtables)",
                    info.stage.name(),
                    item,
                    ByteSize::b(info.module_bytes as u64),
                    info.vtables_found
                ),
                ProgressStage::LoadingModule | ProgressStage::ResolvingSignatures => {
                    format!("{} - {}", info.stage.name(), item)
                }
                _ => info.stage.name().to_string(),
            };

            pb_clone.set_position(info.current as u64);
            pb_clone.set_message(msg);
        })),
    };

    let mut verifier = Verifier::new(config);
    let report = verifier.verify(&document);
    pb.finish_and_clear();

    print_header("VIRTUAL TABLES");
    print_report(&report);

    write_json(output, &report.ordinals())?;
    println!(
        "\n{} resolved, {} unresolved, {} modules skipped -> {}",
        report.resolved_count(),
        report.unresolved_count(),
        report.skipped_modules().count(),
        output.display()
    );

    if strict {
        if let Some(reason) = report.incomplete_reason() {
            anyhow::bail!(reason);
        }
    }

    Ok(())
}

fn print_report(report: &VerifyReport) {
    let mut folder = None;

    for module in &report.modules {
        if folder != Some(module.folder.as_str()) {
            println!("{}", module.folder);
            folder = Some(module.folder.as_str());
        }

        match &module.error {
            Some(error) => {
                println!("  {}: SKIPPED ({})", module.module, error);
                continue;
            }
            None => println!("  {} ({} vtables)", module.module, module.vmt_count),
        }

        for class in &module.classes {
            match class.vmt_methods {
                Some(count) if class.output_name != class.name => {
                    println!("    {} -> {} ({} methods)", class.name, class.output_name, count)
                }
                Some(count) => println!("    {} ({} methods)", class.name, count),
                None => println!("    {} (no vtable)", class.name),
            }

            for method in &class.methods {
                let marker = if method.status.ordinal().is_some() { " " } else { "!" };
                print!("     {marker}{}: {}", method.name, method.status);
                if method.is_ambiguous() {
                    print!(" [ambiguous: {} matches]", method.match_count.unwrap_or_default());
                }
                println!();
            }
        }
    }
}

/// Write `value` as JSON with a 4-space indent.
fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let file =
        File::create(path).with_context(|| format!("could not create {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut writer, formatter);
    value.serialize(&mut serializer)?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct VmtEntry<'a> {
    name: &'a str,
    address: usize,
    methods: &'a [u32],
}

fn list_vmts(path: &Path, filter: Option<&str>, json: bool) -> anyhow::Result<()> {
    let image = PeImage::load(path)?;
    let vmts = find_vmts(&image)?;

    let selected: Vec<_> = vmts
        .values()
        .filter(|vmt| filter.map_or(true, |f| vmt.name.contains(f)))
        .collect();

    if json {
        let entries: Vec<_> = selected
            .iter()
            .map(|vmt| VmtEntry {
                name: &vmt.name,
                address: vmt.address,
                methods: vmt.methods(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!(
        "{} ({}, {} vtables)",
        path.display(),
        ByteSize::b(image.data().len() as u64),
        vmts.len()
    );
    for vmt in selected {
        println!("{vmt}");
    }

    Ok(())
}

fn scan(
    path: &Path,
    combo: &str,
    section: &str,
    steps: &[Step],
    all: bool,
    class: Option<&str>,
    preview: usize,
) -> anyhow::Result<()> {
    let image = PeImage::load(path)?;
    let pattern = Pattern::parse(combo)?;
    image.require_section(section)?;

    let mut matches = scan_section_all(&image, section, &pattern);
    if matches.is_empty() {
        println!("{pattern}: NOT FOUND");
        return Ok(());
    }
    println!("{pattern}: {} match(es) in {section}", matches.len());
    if !all {
        matches.truncate(1);
    }

    let vmts = match class {
        Some(_) => Some(find_vmts(&image)?),
        None => None,
    };
    let vmt = class.zip(vmts.as_ref()).map(|(name, vmts)| (name, vmts.get(name)));

    for matched in matches {
        let Some(function) = apply_steps(&image, matched, steps) else {
            println!("\nmatch at 0x{matched:X}: steps left the image");
            continue;
        };
        let va = image
            .raw_to_rva(function)
            .map(|rva| image.image_base().wrapping_add(rva as u64));

        match va {
            Some(va) => println!("\nmatch at 0x{matched:X} -> 0x{function:X} (VA 0x{va:X})"),
            None => println!("\nmatch at 0x{matched:X} -> 0x{function:X}"),
        }

        match vmt {
            Some((name, Some(vmt))) => {
                let status = match vmt.method_index(function) {
                    Some(ordinal) => MethodStatus::Resolved { ordinal, function },
                    None => MethodStatus::NotInVmt { function },
                };
                println!("  {name}: {status}");
            }
            Some((name, None)) => println!("  {name}: no vtable recovered"),
            None => {}
        }

        for line in disasm::preview(&image, function, preview) {
            println!("  {line}");
        }
    }

    Ok(())
}
