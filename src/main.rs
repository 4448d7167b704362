mod cfg;
mod codec;
mod dataflow;
mod editor;
mod hierarchy;
mod interp;
mod ir;
mod opcodes;
mod pool;
mod transform;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;

use crate::editor::MemberEditor;
use crate::pool::ClassPool;

/// CLI arguments for a deobfuscation run.
#[derive(Parser, Debug)]
#[command(
    name = "unobf",
    about = "Static deobfuscator for JVM bytecode: prunes obfuscation guards, strips dead code and recovers field multipliers.",
    version
)]
struct Cli {
    /// Obfuscated input jar.
    input: PathBuf,
    /// Destination jar.
    output: PathBuf,
    /// Reload and re-validate the produced jar after writing it.
    #[arg(long)]
    test: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }

    let mut pool = ClassPool::new();
    let loaded = pool
        .load_jar(&cli.input)
        .with_context(|| format!("failed to load {}", cli.input.display()))?;
    ignore_library_classes(&mut pool)?;
    pool.rebuild();
    log::info!(
        "loaded {loaded} classes ({} active, {} ignored)",
        pool.len(),
        pool.ignored_len()
    );

    let mut editor = MemberEditor::new();
    for mut transformer in transform::pipeline() {
        let started = Instant::now();
        transformer
            .run(&mut pool)
            .with_context(|| format!("transform failed: {}", transformer.name()))?;
        log::info!(
            "{} finished in {}ms",
            transformer.name(),
            started.elapsed().as_millis()
        );
    }

    editor.commit(&mut pool)?;
    pool.save_to_jar(&cli.output)
        .with_context(|| format!("failed to write {}", cli.output.display()))?;
    log::info!("wrote {}", cli.output.display());

    if cli.test {
        validate(&cli.output)?;
    }
    Ok(())
}

/// Library classes come in namespaced packages; obfuscated program classes
/// sit in the default package. Everything namespaced is kept for resolution
/// only.
fn ignore_library_classes(pool: &mut ClassPool) -> Result<()> {
    let names: Vec<String> = pool
        .classes()
        .filter(|class| class.name.contains('/'))
        .map(|class| class.name.clone())
        .collect();
    for name in names {
        pool.ignore_class(&name)?;
    }
    for class in pool.ignored_classes() {
        log::debug!("library class kept for resolution only: {}", class.name);
    }
    Ok(())
}

/// Reload the produced jar into a fresh pool, which re-parses and re-decodes
/// every entry, and rebuild its hierarchy.
fn validate(path: &Path) -> Result<()> {
    let mut pool = ClassPool::new();
    let count = pool
        .load_jar(path)
        .with_context(|| format!("validation failed for {}", path.display()))?;
    pool.rebuild();
    log::info!("validated {count} classes in {}", path.display());
    Ok(())
}
