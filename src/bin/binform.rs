//! Command-line entry point: compiles a template and its CSV records into
//! binary files.

use anyhow::{bail, Context, Result};
use binform::csv::load_csv;
use binform::sink::FileWriterFactory;
use binform::{CounterStore, Encoder, Entry, Options, Template, Traverser};
use clap::Parser;
use std::cell::RefCell;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "binform", version, about = "Compile CSV records into binary files described by XML templates")]
struct Cli {
    /// Main template file
    #[arg(long)]
    template: PathBuf,

    /// Records for the main template
    #[arg(long)]
    csv: Option<PathBuf>,

    /// A secondary template and its records, walked by combined repeats and imports
    #[arg(long, num_args = 2, value_names = ["TEMPLATE", "CSV"])]
    combine: Vec<PathBuf>,

    /// External parameter available to `external` values and edit rules
    #[arg(short = 'g', num_args = 2, value_names = ["KEY", "VALUE"])]
    global: Vec<String>,

    /// Counter store (default: counter.xml next to the executable)
    #[arg(long)]
    counter: Option<PathBuf>,

    /// Directory for relative paths in templates without a location of their own
    #[arg(long, default_value = ".")]
    base_dir: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {:?}", err);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let options = Options::new()
        .with_base_dir(cli.base_dir.clone())
        .with_externals(cli.global.chunks_exact(2).map(|pair| (pair[0].clone(), pair[1].clone())));

    let counter_path = match &cli.counter {
        Some(path) => path.clone(),
        None => default_counter_path()?,
    };
    let counters = CounterStore::open(&counter_path)
        .with_context(|| format!("opening counter store {}", counter_path.display()))?;
    compile(&cli, options, Rc::new(RefCell::new(counters)))?;
    Ok(())
}

/// Walks the templates named by `cli` and persists the counters they drew.
/// Returns the number of files written.
fn compile(cli: &Cli, options: Options, counters: Rc<RefCell<CounterStore>>) -> Result<usize> {
    let template = Template::load(&cli.template)
        .with_context(|| format!("loading template {}", cli.template.display()))?;
    let mut entry = Entry::new(template);
    if let Some(csv) = &cli.csv {
        let records = load_csv(csv).with_context(|| format!("reading records {}", csv.display()))?;
        entry = entry.with_records(records);
    }

    let mut combined = Vec::new();
    for pair in cli.combine.chunks(2) {
        let [template, csv] = pair else {
            bail!("--combine takes a template and a CSV file");
        };
        let document = Template::load(template)
            .with_context(|| format!("loading template {}", template.display()))?;
        let records = load_csv(csv).with_context(|| format!("reading records {}", csv.display()))?;
        combined.push(Entry::new(document).with_records(records));
    }

    let encoder = Rc::new(Encoder::new(options.clone()).with_counter(Rc::clone(&counters)));
    let traverser = Traverser::new(encoder, Rc::new(FileWriterFactory::new(options)));
    let mut written = 0;
    for sink in traverser.traverse(None, entry, combined) {
        let sink = sink.with_context(|| format!("compiling {}", cli.template.display()))?;
        info!(file = sink.name(), "wrote output");
        written += 1;
    }

    let mut counters = counters.borrow_mut();
    counters
        .save()
        .with_context(|| format!("saving counters to {}", counters.path().display()))?;
    info!(files = written, "done");
    Ok(written)
}

fn default_counter_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("locating the executable")?;
    Ok(exe
        .parent()
        .map(|dir| dir.join("counter.xml"))
        .unwrap_or_else(|| PathBuf::from("counter.xml")))
}
