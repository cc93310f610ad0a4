//! Command line driver for the stree engine.
//!
//! The engine runs over an in-memory block device, so every command builds
//! its own tree: `simulate` drives a seeded file workload through it, `dump`
//! renders the resulting nodes and `config` prints the effective settings.
#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use stree::primitives::pager::{BlockCache, Pager, PagerStats};
use stree::primitives::wal::{JournalStats, MemJournal};
use stree::storage::tree::node::NodeView;
use stree::storage::tree::TreeStatsSnapshot;
use stree::storage::{FileObject, Key, KeyVersion, STree, StoreConfig, TailPolicy};
use stree::types::BlockId;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "stree",
    version,
    about = "Drive the S+-tree engine over an in-memory block device",
    disable_help_subcommand = true
)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Raise log verbosity (RUST_LOG takes precedence)"
    )]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StoreArgs {
    #[arg(long, global = true, value_name = "FILE", env = "STREE_CONFIG", help = "TOML configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, help = "Override the block size (bytes)")]
    block_size: Option<u32>,

    #[arg(long, global = true, help = "Override the device size (blocks)")]
    capacity_blocks: Option<u32>,

    #[arg(long, global = true, value_enum, help = "Override the tail packing policy")]
    tail_policy: Option<TailPolicyArg>,

    #[arg(long, global = true, help = "Override the truncate checkpoint threshold (blocks)")]
    checkpoint_blocks: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, fill, truncate and delete files, checking content after each step.
    Simulate(WorkloadArgs),
    /// Run a workload, then print the tree nodes or one block in hex.
    Dump(DumpCmd),
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Args, Debug, Clone)]
struct WorkloadArgs {
    #[arg(long, default_value_t = 16, help = "Files to create")]
    files: u32,

    #[arg(long, default_value_t = 8, help = "Upper bound on full blocks per file")]
    max_blocks: usize,

    #[arg(long, default_value_t = 0x5eed, help = "Workload seed")]
    seed: u64,

    #[arg(long, value_enum, default_value_t = VersionArg::V1, help = "Item key format")]
    key_version: VersionArg,

    #[arg(long, help = "Delete every other file once truncated")]
    delete: bool,
}

#[derive(Args, Debug)]
struct DumpCmd {
    #[command(flatten)]
    workload: WorkloadArgs,

    #[arg(long, value_name = "ID", help = "Hex dump this block instead of the tree")]
    block: Option<u32>,

    #[arg(long, default_value_t = 32, help = "Bytes of each node shown in the tree view")]
    preview: usize,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum VersionArg {
    V1,
    V2,
}

impl From<VersionArg> for KeyVersion {
    fn from(value: VersionArg) -> Self {
        match value {
            VersionArg::V1 => KeyVersion::V1,
            VersionArg::V2 => KeyVersion::V2,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TailPolicyArg {
    Never,
    Always,
    Small,
}

impl From<TailPolicyArg> for TailPolicy {
    fn from(value: TailPolicyArg) -> Self {
        match value {
            TailPolicyArg::Never => TailPolicy::Never,
            TailPolicyArg::Always => TailPolicy::Always,
            TailPolicyArg::Small => TailPolicy::Small,
        }
    }
}

struct Store {
    pager: Arc<Pager>,
    journal: Arc<MemJournal>,
    tree: STree,
}

#[derive(Debug, Default, Serialize)]
struct SimulationReport {
    seed: u64,
    files: u32,
    bytes_written: u64,
    truncates: u32,
    bytes_removed: u64,
    cuts: u32,
    checkpoints: u32,
    conversions: u32,
    deleted: u32,
    mismatches: Vec<String>,
    pinned_after: u64,
    tree: TreeStatsSnapshot,
    pager: PagerStats,
    journal: JournalStats,
}

#[derive(Debug, Serialize)]
struct NodeDump {
    block: u32,
    level: u16,
    entries: usize,
    free_space: u16,
    first_key: Option<String>,
    last_key: Option<String>,
    children: Vec<u32>,
    preview: String,
}

#[derive(Debug, Serialize)]
struct BlockDump {
    block: u32,
    rows: Vec<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    install_tracing_subscriber(cli.verbose);
    let config = load_config(&cli.store)?;

    match &cli.command {
        Command::Simulate(args) => {
            let store = open_store(&config)?;
            let report = simulate(&store, args)?;
            emit(&cli.format, &report, |_| print_simulation_text(&report))?;
            if !report.mismatches.is_empty() {
                return Err(format!("{} content mismatches", report.mismatches.len()).into());
            }
        }
        Command::Dump(cmd) => {
            let store = open_store(&config)?;
            simulate(&store, &cmd.workload)?;
            match cmd.block {
                Some(id) => {
                    let dump = dump_block(&store, BlockId(id))?;
                    emit(&cli.format, &dump, |_| print_block_text(&dump))?;
                }
                None => {
                    let nodes = dump_tree(&store, cmd.preview)?;
                    emit(&cli.format, &nodes, |_| print_tree_text(&nodes))?;
                }
            }
        }
        Command::Config => {
            let text = config.to_toml_string()?;
            emit(&cli.format, &config, |_| print!("{text}"))?;
        }
    }
    Ok(())
}

fn install_tracing_subscriber(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(args: &StoreArgs) -> Result<StoreConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(block_size) = args.block_size {
        config.block_size = block_size;
    }
    if let Some(capacity) = args.capacity_blocks {
        config.capacity_blocks = capacity;
    }
    if let Some(policy) = args.tail_policy {
        config.tree.tail_policy = policy.into();
    }
    if let Some(blocks) = args.checkpoint_blocks {
        config.tree.truncate_checkpoint_blocks = blocks;
    }
    config.tree.validate()?;
    Ok(config)
}

fn open_store(config: &StoreConfig) -> Result<Store, Box<dyn Error>> {
    let pager = Arc::new(Pager::new(config.pager_options())?);
    let cache: Arc<dyn BlockCache> = pager.clone();
    let journal = Arc::new(MemJournal::new(Arc::clone(&cache)));
    let tree = STree::builder(cache, journal.clone())
        .options(config.tree.clone())
        .create()?;
    debug!(
        block_size = config.block_size,
        capacity_blocks = config.capacity_blocks,
        "opened in-memory store"
    );
    Ok(Store {
        pager,
        journal,
        tree,
    })
}

fn simulate(store: &Store, args: &WorkloadArgs) -> Result<SimulationReport, Box<dyn Error>> {
    let tree = &store.tree;
    let block_size = tree.block_size();
    let version = KeyVersion::from(args.key_version);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut report = SimulationReport {
        seed: args.seed,
        ..SimulationReport::default()
    };
    let mut survivors: Vec<(FileObject, Vec<u8>)> = Vec::new();

    for index in 0..args.files {
        let key = Key::stat_data(1, 100 + index, version);
        let mut file = tree.create_object(key)?;
        let mut model = Vec::new();
        let mut block = vec![0u8; block_size];
        for _ in 0..rng.gen_range(0..=args.max_blocks) {
            rng.fill(&mut block[..]);
            tree.append_block(&mut file, &block)?;
            model.extend_from_slice(&block);
        }
        if rng.gen_bool(0.5) {
            let mut tail = vec![0u8; rng.gen_range(1..block_size)];
            rng.fill(&mut tail[..]);
            tree.write_tail(&mut file, &tail)?;
            model.extend_from_slice(&tail);
        }
        report.files += 1;
        report.bytes_written += model.len() as u64;
        verify(tree, &file, &model, "write", &mut report)?;

        let new_size = rng.gen_range(0..=model.len());
        let truncated = tree.truncate(&mut file, new_size as u64, true)?;
        model.truncate(new_size);
        report.truncates += 1;
        report.bytes_removed += truncated.bytes_removed;
        report.cuts += truncated.cuts;
        report.checkpoints += truncated.checkpoints;
        report.conversions += u32::from(truncated.converted);
        verify(tree, &file, &model, "truncate", &mut report)?;
        survivors.push((file, model));
    }

    if args.delete {
        let mut kept = Vec::with_capacity(survivors.len());
        for (index, (file, model)) in survivors.into_iter().enumerate() {
            if index % 2 == 0 {
                tree.delete_object(file)?;
                report.deleted += 1;
            } else {
                kept.push((file, model));
            }
        }
        survivors = kept;
    }
    for (file, model) in &survivors {
        let reloaded = tree.load_object(&file.key)?;
        verify(tree, &reloaded, model, "reload", &mut report)?;
    }

    report.pinned_after = store.pager.pinned();
    report.tree = tree.stats().snapshot();
    report.pager = store.pager.stats();
    report.journal = store.journal.stats();
    tree.stats().emit_tracing();
    info!(
        files = report.files,
        truncates = report.truncates,
        mismatches = report.mismatches.len(),
        "workload finished"
    );
    Ok(report)
}

fn verify(
    tree: &STree,
    file: &FileObject,
    model: &[u8],
    phase: &str,
    report: &mut SimulationReport,
) -> Result<(), Box<dyn Error>> {
    let content = tree.read_content(file)?;
    if content != model {
        let at = content
            .iter()
            .zip(model)
            .position(|(a, b)| a != b)
            .unwrap_or_else(|| content.len().min(model.len()));
        report.mismatches.push(format!(
            "{} after {phase}: {} bytes stored, {} expected, first difference at {at}",
            file.key,
            content.len(),
            model.len()
        ));
    }
    Ok(())
}

fn dump_tree(store: &Store, preview: usize) -> Result<Vec<NodeDump>, Box<dyn Error>> {
    let root = store.tree.root();
    let mut queue = VecDeque::from([root.block]);
    let mut nodes = Vec::new();
    while let Some(id) = queue.pop_front() {
        let block = store.pager.pin(id)?;
        let data = block.data();
        let view = NodeView::new(&data)?;
        let head = view.head();
        let keys = view.nr_items();
        let key_at = |index: usize| view.key(index).map(|key| key.to_string());
        let mut children = Vec::new();
        if !view.is_leaf() {
            for index in 0..=keys {
                let child = view.child(index)?.block;
                children.push(child.0);
                queue.push_back(child);
            }
        }
        nodes.push(NodeDump {
            block: id.0,
            level: head.level,
            entries: keys,
            free_space: head.free_space,
            first_key: if keys > 0 { Some(key_at(0)?) } else { None },
            last_key: if keys > 0 { Some(key_at(keys - 1)?) } else { None },
            children,
            preview: hex::encode(&data[..preview.min(data.len())]),
        });
    }
    Ok(nodes)
}

fn dump_block(store: &Store, id: BlockId) -> Result<BlockDump, Box<dyn Error>> {
    let block = store.pager.pin(id)?;
    let data = block.data();
    let rows = data
        .chunks(32)
        .enumerate()
        .map(|(row, chunk)| format!("{:06x}  {}", row * 32, hex::encode(chunk)))
        .collect();
    Ok(BlockDump { block: id.0, rows })
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_simulation_text(report: &SimulationReport) {
    println!("Workload (seed {:#x})", report.seed);
    println!("  files          : {}", report.files);
    println!("  bytes written  : {}", report.bytes_written);
    println!("  truncates      : {}", report.truncates);
    println!("  bytes removed  : {}", report.bytes_removed);
    println!("  cuts           : {}", report.cuts);
    println!("  checkpoints    : {}", report.checkpoints);
    println!("  conversions    : {}", report.conversions);
    println!("  deleted        : {}", report.deleted);
    println!("  pinned after   : {}", report.pinned_after);
    let tree = &report.tree;
    println!("Tree");
    println!("  searches       : {}", tree.searches);
    println!("  restarts       : {}", tree.restarts);
    println!("  balance repeats: {}", tree.balance_repeats);
    println!("  leaf splits    : {}", tree.leaf_splits);
    println!("  internal splits: {}", tree.internal_splits);
    println!("  nodes removed  : {}", tree.nodes_removed);
    println!("  rollbacks      : {}", tree.rollbacks);
    println!("  busy waits     : {}", tree.busy_waits);
    println!("  blocks freed   : {}", tree.blocks_freed);
    println!("Pager   {}", report.pager);
    println!("Journal {}", report.journal);
    if report.mismatches.is_empty() {
        println!("Content verified");
    } else {
        println!("Mismatches");
        for line in &report.mismatches {
            println!("  {line}");
        }
    }
}

fn print_tree_text(nodes: &[NodeDump]) {
    for node in nodes {
        let kind = if node.level == 1 { "leaf" } else { "internal" };
        println!(
            "block {:>5} {kind:<8} level {} entries {:>3} free {:>5}",
            node.block, node.level, node.entries, node.free_space
        );
        if let (Some(first), Some(last)) = (&node.first_key, &node.last_key) {
            println!("    keys     {first} .. {last}");
        }
        if !node.children.is_empty() {
            println!("    children {:?}", node.children);
        }
        println!("    head     {}", node.preview);
    }
}

fn print_block_text(dump: &BlockDump) {
    println!("block {}", dump.block);
    for row in &dump.rows {
        println!("{row}");
    }
}
