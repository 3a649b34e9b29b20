#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use asupersync::Cx;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sio::allocator::{Allocator, AllocatorLayout, GrowMapFn, PersistentStorage, RawBitmap};
use sio::block::{BlockDevice, MemBlockDevice, ReadTxn, WriteTxn};
use sio::journal::{AutoMergeStrategy, MergeConfig, MergeResolver, PageStorage, PreferLeft};
use sio::sched::{
    Issued, OpClass, Scheduler, SchedulerClient, SchedulerConfig, SchedulerStats, StreamOp,
};
use sio::{BlockNumber, KeyPriority, OpId, StreamId};
use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

// ── Cx acquisition ──────────────────────────────────────────────────────────

/// Request-scoped `Cx` with an infinite budget; every command runs to
/// completion.
fn cli_cx() -> Cx {
    Cx::for_request()
}

// ── Configuration ───────────────────────────────────────────────────────────

/// Optional JSON config passed with `--config`. Missing fields keep their
/// defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct CliConfig {
    block_size: u32,
    scheduler: SchedulerConfig,
    allocator: AllocatorLayout,
    merge: MergeConfig,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            scheduler: SchedulerConfig::default(),
            allocator: AllocatorLayout::default(),
            merge: MergeConfig::default(),
        }
    }
}

fn load_config(path: Option<&str>) -> Result<CliConfig> {
    let Some(path) = path else {
        return Ok(CliConfig::default());
    };
    let text = std::fs::read_to_string(Path::new(path))
        .with_context(|| format!("failed to read config {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {path}"))
}

// ── Argument parsing ────────────────────────────────────────────────────────

struct Args {
    rest: Vec<String>,
}

impl Args {
    fn flag(&self, name: &str) -> bool {
        self.rest.iter().any(|a| a == name)
    }

    fn value(&self, name: &str) -> Result<Option<&str>> {
        let Some(pos) = self.rest.iter().position(|a| a == name) else {
            return Ok(None);
        };
        match self.rest.get(pos + 1) {
            Some(value) => Ok(Some(value.as_str())),
            None => bail!("{name} requires a value"),
        }
    }

    fn number<T: std::str::FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.value(name)? {
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow::anyhow!("{name}: not a number: {raw}")),
            None => Ok(default),
        }
    }
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let mut argv = env::args().skip(1);
    let Some(command) = argv.next() else {
        print_usage();
        return Ok(());
    };
    let args = Args {
        rest: argv.collect(),
    };
    let json = args.flag("--json");
    let config = load_config(args.value("--config")?)?;

    match command.as_str() {
        "sched" => {
            let streams = args.number("--streams", 8_u32)?;
            let ops = args.number("--ops", 64_u64)?;
            let workers = args.number("--workers", 4_usize)?;
            let report = sched_cmd(&config, streams, ops, workers)?;
            emit(&report, json, print_sched)
        }
        "alloc" => {
            let units = args.number("--units", 2_000_u32)?;
            let report = alloc_cmd(&config, units)?;
            emit(&report, json, print_alloc)
        }
        "journal" => {
            let writers = args.number("--writers", 3_usize)?;
            let report = journal_cmd(&config, writers)?;
            emit(&report, json, print_journal)
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
    println!("sio-cli\n");
    println!("USAGE:");
    println!("  sio-cli sched [--streams N] [--ops N] [--workers N] [--config FILE] [--json]");
    println!("  sio-cli alloc [--units N] [--config FILE] [--json]");
    println!("  sio-cli journal [--writers N] [--config FILE] [--json]");
}

fn emit<T: Serialize>(report: &T, json: bool, human: fn(&T)) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(report).context("serialize output")?
        );
    } else {
        human(report);
    }
    Ok(())
}

// ── sched ───────────────────────────────────────────────────────────────────

/// Runs ops against an in-memory device and records issue order.
struct DeviceClient {
    cx: Cx,
    dev: MemBlockDevice,
    issued: Mutex<Vec<StreamId>>,
    failed: Mutex<u64>,
}

impl SchedulerClient for DeviceClient {
    fn issue(&self, mut op: StreamOp) -> Issued {
        self.issued.lock().push(op.stream);
        let block = BlockNumber(op.offset);
        let result = match op.class {
            OpClass::Read => self.dev.read_block(&self.cx, block).map(|_| ()),
            OpClass::Write => self.dev.write_block(&self.cx, block, &op.data),
            OpClass::Flush => self.dev.sync(&self.cx),
        };
        op.set_result(result);
        Issued::Complete(op)
    }

    fn release(&self, op: StreamOp) {
        if matches!(op.result(), Some(Err(_))) {
            *self.failed.lock() += 1;
        }
    }
}

#[derive(Debug, Serialize)]
struct SchedReport {
    streams: u32,
    workers: usize,
    stats: SchedulerStats,
    failed: u64,
    blocks_written: usize,
    /// Position of each stream's last issued op, by priority.
    last_issue_by_priority: BTreeMap<u32, usize>,
}

fn sched_cmd(config: &CliConfig, streams: u32, ops: u64, workers: usize) -> Result<SchedReport> {
    if streams == 0 {
        bail!("--streams must be at least 1");
    }
    let block_size = config.block_size;
    let client = Arc::new(DeviceClient {
        cx: cli_cx(),
        dev: MemBlockDevice::new(block_size, ops.max(1)),
        issued: Mutex::new(Vec::new()),
        failed: Mutex::new(0),
    });
    let scheduler = Arc::new(Scheduler::new());
    scheduler
        .init_with_config(Arc::clone(&client) as Arc<dyn SchedulerClient>, config.scheduler)
        .context("scheduler init")?;

    for stream in 0..streams {
        scheduler
            .stream_open(StreamId(stream), stream % 32)
            .with_context(|| format!("open stream {stream}"))?;
    }
    // Enqueue before serving so priorities decide the order.
    let batch: Vec<StreamOp> = (0..ops)
        .map(|n| {
            let stream = StreamId(u32::try_from(n % u64::from(streams)).unwrap_or(0));
            let class = if n % 5 == 4 { OpClass::Read } else { OpClass::Write };
            let op = StreamOp::new(OpId(n), stream, class, n, 1);
            if class == OpClass::Write {
                op.with_data(vec![(n % 251) as u8; block_size as usize])
            } else {
                op
            }
        })
        .collect();
    let outcome = scheduler.enqueue(batch);
    if !outcome.rejected.is_empty() {
        bail!("{} ops rejected", outcome.rejected.len());
    }
    scheduler.serve(workers).context("start workers")?;
    scheduler.shutdown().context("scheduler shutdown")?;

    let mut last_issue_by_priority = BTreeMap::new();
    for (pos, stream) in client.issued.lock().iter().enumerate() {
        last_issue_by_priority.insert(stream.0 % 32, pos);
    }
    let failed = *client.failed.lock();
    Ok(SchedReport {
        streams,
        workers,
        stats: scheduler.stats(),
        failed,
        blocks_written: client.dev.written_blocks(),
        last_issue_by_priority,
    })
}

fn print_sched(report: &SchedReport) {
    println!("sio scheduler run");
    println!("streams: {}", report.streams);
    println!("workers: {}", report.workers);
    println!("enqueued: {}", report.stats.enqueued);
    println!("issued: {}", report.stats.issued);
    println!("completed: {}", report.stats.completed);
    println!("failed: {}", report.failed);
    println!("blocks_written: {}", report.blocks_written);
}

// ── alloc ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AllocReport {
    requested: u32,
    pool_total: u32,
    allocated: u32,
    available: u32,
    extends: u32,
    regions: Vec<(u32, u32)>,
    blocks_written: usize,
    reloaded_allocated: u32,
}

fn alloc_cmd(config: &CliConfig, units: u32) -> Result<AllocReport> {
    let cx = cli_cx();
    let layout = config.allocator;
    let block_count = layout.meta_block.max(layout.bitmap_start) + layout.bitmap_blocks_max + 1;
    let dev = MemBlockDevice::new(config.block_size, block_count);

    let mut storage =
        PersistentStorage::new(layout, config.block_size).context("allocator layout")?;
    let mut map = RawBitmap::default();
    let mut txn = WriteTxn::new();
    storage
        .format(&cx, &mut txn, &mut map, layout.units_per_extend)
        .context("format pool")?;

    let extends = Arc::new(Mutex::new(0_u32));
    let mut alloc = Allocator::new(storage, map, grow_hook(layout.units_per_extend, &extends))?;
    for _ in 0..units {
        alloc.allocate(&cx, &mut txn).context("allocate")?;
    }
    // Return every third unit so the map has holes.
    for unit in (0..units).step_by(3) {
        alloc.free(&cx, &mut txn, unit).context("free")?;
    }
    let blocks_written = txn.apply(&cx, &dev).context("apply transaction")?;

    let reloaded = {
        let storage = PersistentStorage::new(layout, config.block_size)?;
        let mut read = ReadTxn::new(&dev);
        let total = alloc.pool_total();
        let hook: GrowMapFn = Box::new(move |_| Ok(total));
        Allocator::load(&cx, storage, &mut read, hook).context("reload pool")?
    };

    let extends = *extends.lock();
    Ok(AllocReport {
        requested: units,
        pool_total: alloc.pool_total(),
        allocated: alloc.allocated(),
        available: alloc.pool_available(),
        extends,
        regions: alloc.allocated_regions(),
        blocks_written,
        reloaded_allocated: reloaded.allocated(),
    })
}

/// Growth hook that accepts every request and counts them.
fn grow_hook(initial: u32, extends: &Arc<Mutex<u32>>) -> GrowMapFn {
    let extends = Arc::clone(extends);
    let mut current = initial;
    Box::new(move |new_total| {
        let old = current;
        current = new_total;
        *extends.lock() += 1;
        Ok(old)
    })
}

fn print_alloc(report: &AllocReport) {
    println!("sio allocator run");
    println!("pool_total: {}", report.pool_total);
    println!("allocated: {}", report.allocated);
    println!("available: {}", report.available);
    println!("extends: {}", report.extends);
    println!("regions: {}", report.regions.len());
    println!("blocks_written: {}", report.blocks_written);
    println!("reloaded_allocated: {}", report.reloaded_allocated);
}

// ── journal ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JournalReport {
    writers: usize,
    commits: usize,
    heads_before_merge: usize,
    merge_rounds: usize,
    fast_forwards: usize,
    heads_after_merge: usize,
    head: String,
    entries: BTreeMap<String, String>,
    objects_to_sync: usize,
}

fn journal_cmd(config: &CliConfig, writers: usize) -> Result<JournalReport> {
    let cx = cli_cx();
    let storage = PageStorage::new();
    let first = storage.first_commit().id();

    // Every writer touches its own key and the shared "owner" key.
    for writer in 0..writers {
        let mut journal = storage.start_commit(&first)?;
        let own = storage.add_object(format!("data-{writer}").into_bytes());
        let owner = storage.add_object(format!("writer-{writer}").into_bytes());
        journal.put(format!("key-{writer}"), own, KeyPriority::Eager);
        journal.put("owner", owner, KeyPriority::Lazy);
        storage.commit_journal(&cx, journal)?;
    }
    let heads_before_merge = storage.head_commits().len();

    let strategy = AutoMergeStrategy::with_resolver(Arc::new(PreferLeft));
    let report = MergeResolver::new(strategy, config.merge).resolve(&cx, &storage)?;

    let head = storage
        .head_commits()
        .first()
        .map(|c| c.id())
        .context("page has no head")?;
    let entries = storage
        .contents(&cx, &head)?
        .into_iter()
        .map(|e| (String::from_utf8_lossy(&e.key).into_owned(), e.value.to_string()))
        .collect();

    Ok(JournalReport {
        writers,
        commits: storage.commit_count(),
        heads_before_merge,
        merge_rounds: report.rounds,
        fast_forwards: report.fast_forwards,
        heads_after_merge: report.remaining_heads,
        head: head.to_string(),
        entries,
        objects_to_sync: storage.objects_to_sync().len(),
    })
}

fn print_journal(report: &JournalReport) {
    println!("sio journal run");
    println!("writers: {}", report.writers);
    println!("commits: {}", report.commits);
    println!("heads_before_merge: {}", report.heads_before_merge);
    println!("merge_rounds: {}", report.merge_rounds);
    println!("fast_forwards: {}", report.fast_forwards);
    println!("heads_after_merge: {}", report.heads_after_merge);
    println!("head: {}", report.head);
    for (key, value) in &report.entries {
        println!("  {key} = {value}");
    }
}
