//! Copies every `*.txt` file of the current directory into the output tree
//! and writes a checksum file next to them.
//!
//! ```sh
//! cargo run --example pipeline --features logging -- build
//! ```

use std::fmt::Write as _;
use std::fs;

use camino::Utf8Path;
use haori::{
    Addon, AddonDef, AddonFactory, Config, Hook, Manager, Phase, ResourceId, RunContext, Tasks,
    TaskDescriptor,
};

fn contents() -> AddonDef {
    AddonDef::new("contents").on(Phase::main(Hook::Build), |ctx, tasks| {
        for source in ctx.glob("*.txt")? {
            let target = ctx.output(Utf8Path::new("files").join(source.as_path()));
            let (from, to) = (source.clone(), target.clone());

            tasks.add(
                TaskDescriptor::new(format!("copy:/files/{source}"))
                    .doc("copy a text file into the output")
                    .file_dep(source)
                    .target(target)
                    .run(move |ctx| {
                        let to = ctx.resolve(&to);
                        if let Some(parent) = to.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::copy(ctx.resolve(&from), to)?;
                        Ok(())
                    }),
            );
        }
        Ok(())
    })
}

/// Lists a blake3 checksum of every copied file.
struct Checksums;

impl Addon for Checksums {
    fn name(&self) -> &str {
        "checksums"
    }

    fn capabilities(&self) -> std::collections::BTreeSet<Phase> {
        [Phase::post(Hook::Build)].into()
    }

    fn tasks(&self, _: Phase, ctx: &RunContext, tasks: &mut Tasks) -> anyhow::Result<()> {
        let inputs: Vec<ResourceId> = ctx
            .glob("*.txt")?
            .iter()
            .map(|id| ctx.output(Utf8Path::new("files").join(id.as_path())))
            .collect();

        let sums = ctx.output("CHECKSUMS");
        let target = sums.clone();

        tasks.add(
            TaskDescriptor::new("")
                .file_deps(inputs.clone())
                .target(sums)
                .run(move |ctx| {
                    let mut text = String::new();
                    for input in &inputs {
                        let hash = blake3::hash(&fs::read(ctx.resolve(input))?);
                        writeln!(text, "{}  {input}", hash.to_hex())?;
                    }
                    fs::write(ctx.resolve(&target), text)?;
                    Ok(())
                }),
        );

        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    haori::logging::init(false)?;

    let hook = std::env::args().nth(1).unwrap_or_else(|| "build".into());

    let config = match Utf8Path::new("haori.toml").exists() {
        true => Config::load("haori.toml")?,
        false => Config::default(),
    };

    let manager = Manager::builder(config)
        .addon(AddonFactory::of(contents()))
        .addon(AddonFactory::of(Checksums))
        .finish()?;

    let report = manager.run(&hook)?;
    eprintln!("{report}");

    // HAORI_GRAPH=graph.mmd writes the coloured task graph of this run
    if let Ok(path) = std::env::var("HAORI_GRAPH") {
        let graph = manager.graph(&hook)?;
        fs::write(path, report.render_mermaid(&graph))?;
    }

    std::process::exit(report.exit_code());
}
