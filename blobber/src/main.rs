mod output;

use anyhow::{Context, Result, anyhow};
use blobber_core::reference::{base_name, clean_path, get_object_path, get_reference, get_ref_with_sorted_children};
use blobber_core::{
    Allocation, AllocationChange, Attributes, AttributesChange, CancelToken, ChangeProcessor,
    CommitOutcome, Config, CopyFileChange, DeleteFileChange, FileInputData, FileStore,
    MemoryStore, NewFileChange, PoolStore, ReadPool, RefStore, RenameFileChange, Session, Terms,
    Timestamp, UpdateFileChange, WhoPays, WritePool, get_pending, reference_lookup, reserve_write,
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use output::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const META_FILE: &str = "meta.json";
const FILES_DIR: &str = "files";

/// Blobber - storage node core
#[derive(Parser)]
#[command(name = "blobber")]
#[command(about = "Content store and reference tree of a storage node", long_about = None)]
#[command(version)]
struct Cli {
    /// Store root directory (defaults to BLOBBER_ROOT env var or ./blobber-store)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Allocation to operate on
    #[arg(short, long, global = true, env = "BLOBBER_ALLOCATION")]
    allocation: Option<String>,

    /// Client owning the session or pools
    #[arg(long, global = true, env = "BLOBBER_CLIENT", default_value = "client")]
    client: String,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new store
    Init {
        /// ID of this blobber
        #[arg(long)]
        blobber_id: String,
    },

    /// Upload a local file
    Put {
        /// Local file to read
        local: PathBuf,

        /// Path inside the allocation
        remote: String,

        /// Replace an existing file instead of inserting a new one
        #[arg(long)]
        update: bool,

        #[arg(long, default_value = "")]
        mimetype: String,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Delete a file or directory
    Rm {
        path: String,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Rename a file or directory in place
    Mv {
        path: String,
        new_name: String,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Copy a file or directory into another directory
    Cp {
        path: String,
        dest_dir: String,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Set who pays for reads of a file
    Attrs {
        path: String,

        /// owner or 3rd_party; omitted resets the attributes
        #[arg(long)]
        who_pays: Option<String>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// List a directory or show a file
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Read blocks of a stored file
    Block {
        path: String,

        /// 1-indexed block number
        block_num: i64,

        #[arg(long, default_value_t = 1)]
        count: i64,
    },

    /// Produce a challenge proof for one leaf of a file
    Challenge {
        path: String,
        block_offset: i64,
    },

    /// Proof path to the file holding an allocation-wide block
    ObjectPath { block_num: i64 },

    /// Disk usage of the store, or of one allocation
    Du,

    /// List committed objects of the allocation
    Objects,

    /// Show the lookup hash of a path
    Lookup { path: String },

    /// Price reads and writes against the client's pools
    Price {
        #[command(flatten)]
        terms: TermsArgs,

        /// Blocks to read
        #[arg(long, default_value_t = 0)]
        blocks: i64,

        /// Bytes to write
        #[arg(long, default_value_t = 0)]
        size: i64,

        /// Add the write to the pending counter if the pools cover it
        #[arg(long)]
        reserve: bool,
    },

    /// Manage the client's prepaid pools
    #[command(subcommand)]
    Pool(PoolCommands),
}

#[derive(clap::Args)]
struct SessionArgs {
    /// Connection ID of the session (generated if omitted)
    #[arg(long)]
    connection: Option<String>,

    /// Expected allocation root after the change
    #[arg(long, default_value = "")]
    expect_root: String,
}

#[derive(clap::Args)]
struct TermsArgs {
    /// Price per GB read
    #[arg(long, default_value_t = 0)]
    read_price: i64,

    /// Price per GB stored per time unit
    #[arg(long, default_value_t = 0)]
    write_price: i64,

    /// Seconds until the allocation expires
    #[arg(long, default_value_t = 0)]
    expires_in: i64,

    /// Length of one time unit in seconds
    #[arg(long, default_value_t = 3600)]
    time_unit: u64,
}

#[derive(Subcommand)]
enum PoolCommands {
    /// Replace the read pools with one pool
    Read {
        balance: i64,

        /// Seconds until the pool expires
        #[arg(long)]
        expires_in: i64,
    },

    /// Replace the write pools with one pool
    Write {
        balance: i64,

        #[arg(long)]
        expires_in: i64,
    },

    /// Show live pools and pending writes
    Show,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let out = OutputWriter::new(cli.json);
    if let Err(e) = run(cli, &out) {
        out.write_error(&e, 1);
        std::process::exit(1);
    }
}

fn run(cli: Cli, out: &OutputWriter) -> Result<()> {
    // CLI arg > BLOBBER_ROOT env var > ./blobber-store
    let root = cli
        .root
        .or_else(|| std::env::var("BLOBBER_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./blobber-store"));

    if let Commands::Init { blobber_id } = &cli.command {
        return cmd_init(&root, blobber_id, out);
    }

    let node = Node::open(&root)?;
    let alloc = || {
        cli.allocation
            .as_deref()
            .ok_or_else(|| anyhow!("no allocation given (use --allocation or BLOBBER_ALLOCATION)"))
    };
    let target = |session: &SessionArgs| -> Result<Target> {
        Ok(Target {
            allocation_id: alloc()?.to_string(),
            client_id: cli.client.clone(),
            connection_id: session.connection.clone().unwrap_or_else(new_connection_id),
            expect_root: session.expect_root.clone(),
        })
    };

    match &cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Put {
            local,
            remote,
            update,
            mimetype,
            session,
        } => cmd_put(&node, &target(session)?, local, remote, *update, mimetype, out),
        Commands::Rm { path, session } => {
            let change = DeleteFileChange {
                path: clean_path(path),
                ..Default::default()
            };
            let size = node
                .meta
                .get_ref(alloc()?, &change.path)?
                .map(|r| -r.size)
                .unwrap_or_default();
            cmd_change(&node, &target(session)?, size, change.into(), out)
        }
        Commands::Mv {
            path,
            new_name,
            session,
        } => {
            let change = RenameFileChange {
                path: clean_path(path),
                new_name: new_name.clone(),
                ..Default::default()
            };
            cmd_change(&node, &target(session)?, 0, change.into(), out)
        }
        Commands::Cp {
            path,
            dest_dir,
            session,
        } => {
            let change = CopyFileChange {
                path: clean_path(path),
                dest_path: clean_path(dest_dir),
                ..Default::default()
            };
            let size = node
                .meta
                .get_ref(alloc()?, &change.path)?
                .map(|r| r.size)
                .unwrap_or_default();
            cmd_change(&node, &target(session)?, size, change.into(), out)
        }
        Commands::Attrs {
            path,
            who_pays,
            session,
        } => {
            let attributes = who_pays
                .as_deref()
                .map(|w| w.parse::<WhoPays>().map(Attributes::new))
                .transpose()?;
            let change = AttributesChange {
                path: clean_path(path),
                attributes,
                ..Default::default()
            };
            cmd_change(&node, &target(session)?, 0, change.into(), out)
        }
        Commands::Ls { path } => cmd_ls(&node, alloc()?, path, out),
        Commands::Block {
            path,
            block_num,
            count,
        } => cmd_block(&node, alloc()?, path, *block_num, *count, out),
        Commands::Challenge { path, block_offset } => cmd_challenge(&node, alloc()?, path, *block_offset, out),
        Commands::ObjectPath { block_num } => cmd_object_path(&node, alloc()?, *block_num, out),
        Commands::Du => cmd_du(&node, cli.allocation.as_deref(), out),
        Commands::Objects => cmd_objects(&node, alloc()?, out),
        Commands::Lookup { path } => cmd_lookup(&node, alloc()?, path, out),
        Commands::Price {
            terms,
            blocks,
            size,
            reserve,
        } => cmd_price(&node, alloc()?, &cli.client, terms, *blocks, *size, *reserve, out),
        Commands::Pool(cmd) => cmd_pool(&node, alloc()?, &cli.client, cmd, out),
    }
}

/// Everything under one store root.
struct Node {
    root: PathBuf,
    config: Config,
    files: FileStore,
    meta: MemoryStore,
}

impl Node {
    fn open(root: &Path) -> Result<Self> {
        let config = Config::load(root).with_context(|| format!("Failed to open store at {}", root.display()))?;
        let files = FileStore::open(root.join(FILES_DIR))
            .with_context(|| format!("Failed to open file store under {}", root.display()))?;
        let meta = MemoryStore::load(&root.join(META_FILE)).with_context(|| "Failed to load metadata")?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            files,
            meta,
        })
    }

    fn persist(&self) -> Result<()> {
        self.meta
            .persist(&self.root.join(META_FILE))
            .with_context(|| "Failed to save metadata")
    }
}

struct Target {
    allocation_id: String,
    client_id: String,
    connection_id: String,
    expect_root: String,
}

fn new_connection_id() -> String {
    format!("cli{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
}

fn now() -> Timestamp {
    Utc::now().timestamp()
}

/// Record `changes` in a fresh session and commit it.
///
/// A failed commit abandons the session so its staged bytes do not linger.
fn run_session(node: &Node, target: &Target, changes: Vec<(AllocationChange, ChangeProcessor)>) -> Result<CommitOutcome> {
    let session = Session::new(
        &node.meta,
        &node.files,
        &target.connection_id,
        &target.allocation_id,
        &target.client_id,
    );
    let cancel = CancelToken::new();

    let result = session
        .record(changes)
        .and_then(|_| session.commit(&target.expect_root, &cancel));
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Err(cleanup) = session.abandon() {
                warn!(connection = %target.connection_id, error = %cleanup, "could not abandon session");
            }
            node.persist()?;
            return Err(e).with_context(|| format!("Session {} failed", target.connection_id));
        }
    };
    node.persist()?;
    info!(connection = %target.connection_id, root = %outcome.root.hash, "session done");
    Ok(outcome)
}

fn write_session(out: &OutputWriter, target: &Target, operation: &str, outcome: CommitOutcome) -> Result<()> {
    let output = SessionOutput {
        success: true,
        result_code: 0,
        connection_id: target.connection_id.clone(),
        operation: operation.to_string(),
        allocation_root: outcome.root.hash,
        committed: outcome.committed,
    };
    out.write(&output, || {
        format!(
            "{} committed in session {}\nallocation root: {}\n",
            output.operation, output.connection_id, output.allocation_root
        )
    })
}

fn cmd_init(root: &Path, blobber_id: &str, out: &OutputWriter) -> Result<()> {
    let config = Config::new(blobber_id);
    config
        .write(root)
        .with_context(|| format!("Failed to initialize store at {}", root.display()))?;
    FileStore::init(root.join(FILES_DIR)).with_context(|| "Failed to create file store")?;
    let meta_path = root.join(META_FILE);
    if !meta_path.exists() {
        MemoryStore::new()
            .persist(&meta_path)
            .with_context(|| "Failed to write metadata")?;
    }

    let output = InitOutput {
        success: true,
        result_code: 0,
        root: root.display().to_string(),
        blobber_id: config.blobber_id,
    };
    out.write(&output, || {
        format!(
            "Initialized blobber store at {}\nBlobber: {}\n",
            output.root, output.blobber_id
        )
    })
}

fn cmd_put(
    node: &Node,
    target: &Target,
    local: &Path,
    remote: &str,
    update: bool,
    mimetype: &str,
    out: &OutputWriter,
) -> Result<()> {
    let remote = clean_path(remote);
    let name = base_name(&remote);
    let file = fs::File::open(local).with_context(|| format!("Failed to open {}", local.display()))?;

    let session = Session::new(
        &node.meta,
        &node.files,
        &target.connection_id,
        &target.allocation_id,
        &target.client_id,
    );
    let staged = session
        .stage(&name, &remote, file, &CancelToken::new())
        .with_context(|| format!("Failed to stage {}", local.display()))?;

    let change = NewFileChange {
        connection_id: target.connection_id.clone(),
        allocation_id: target.allocation_id.clone(),
        filename: name,
        path: remote,
        actual_hash: staged.content_hash.clone(),
        actual_size: staged.size,
        mimetype: mimetype.to_string(),
        hash: staged.content_hash,
        merkle_root: staged.merkle_root,
        size: staged.size,
        ..Default::default()
    };
    let (operation, processor): (&str, ChangeProcessor) = if update {
        ("update", UpdateFileChange::new(change).into())
    } else {
        ("insert", change.into())
    };

    let outcome = run_session(node, target, vec![(AllocationChange::new(staged.size), processor)])?;
    write_session(out, target, operation, outcome)
}

fn cmd_change(node: &Node, target: &Target, size: i64, processor: ChangeProcessor, out: &OutputWriter) -> Result<()> {
    let operation = processor.operation().to_string();
    let outcome = run_session(node, target, vec![(AllocationChange::new(size), processor)])?;
    write_session(out, target, &operation, outcome)
}

fn cmd_ls(node: &Node, allocation_id: &str, path: &str, out: &OutputWriter) -> Result<()> {
    let path = clean_path(path);
    let entry = get_ref_with_sorted_children(&node.meta, allocation_id, &path)
        .with_context(|| format!("Failed to list {}", path))?;

    let output = LsOutput {
        success: true,
        result_code: 0,
        entry: EntryInfo::from(&entry),
        children: entry.children.iter().map(EntryInfo::from).collect(),
    };
    out.write(&output, || {
        let row = |e: &EntryInfo| format!("{:<4} {:>10} {} {}\n", e.entry_type, e.size, e.hash, e.path);
        let mut text = row(&output.entry);
        for child in &output.children {
            text.push_str(&row(child));
        }
        text
    })
}

fn stored_input(node: &Node, allocation_id: &str, path: &str) -> Result<FileInputData> {
    let path = clean_path(path);
    let file = get_reference(&node.meta, allocation_id, &path).with_context(|| format!("No file at {}", path))?;
    if !file.is_file() {
        anyhow::bail!("{} is a directory", path);
    }
    Ok(FileInputData::new(file.name, file.path, file.content_hash))
}

fn cmd_block(node: &Node, allocation_id: &str, path: &str, block_num: i64, count: i64, out: &OutputWriter) -> Result<()> {
    let input = stored_input(node, allocation_id, path)?;
    let data = node
        .files
        .get_file_block(allocation_id, &input, block_num, count)
        .with_context(|| format!("Failed to read block {} of {}", block_num, input.path))?;

    if !out.is_json() {
        return out.write_raw(&data);
    }
    let output = BlockOutput {
        success: true,
        result_code: 0,
        path: input.path,
        block_num,
        size: data.len(),
        data: hex::encode(&data),
    };
    out.write(&output, String::new)
}

fn cmd_challenge(node: &Node, allocation_id: &str, path: &str, block_offset: i64, out: &OutputWriter) -> Result<()> {
    let input = stored_input(node, allocation_id, path)?;
    let challenge = node
        .files
        .get_file_block_for_challenge(allocation_id, &input, block_offset)
        .with_context(|| format!("Failed to challenge {}", input.path))?;

    let output = ChallengeOutput {
        success: true,
        result_code: 0,
        path: input.path,
        block_offset,
        verified: challenge.verify(),
        merkle_root: challenge.merkle_root,
        proof_nodes: challenge.merkle_path.nodes,
        data: hex::encode(&challenge.data),
    };
    out.write(&output, || {
        format!(
            "merkle root: {}\nleaf bytes: {}\nproof nodes: {}\nverified: {}\n",
            output.merkle_root,
            output.data.len() / 2,
            output.proof_nodes.len(),
            output.verified
        )
    })
}

fn cmd_object_path(node: &Node, allocation_id: &str, block_num: i64, out: &OutputWriter) -> Result<()> {
    let object_path = get_object_path(&node.meta, allocation_id, block_num)
        .with_context(|| format!("Failed to build object path for block {}", block_num))?;
    let output = ObjectPathOutput {
        success: true,
        result_code: 0,
        block_num,
        object_path,
    };
    out.write(&output, || {
        let op = &output.object_path;
        format!(
            "root: {}\nref: {}\nfile block: {}\n",
            op.root_hash, op.ref_id, op.file_block_num
        )
    })
}

fn cmd_du(node: &Node, allocation_id: Option<&str>, out: &OutputWriter) -> Result<()> {
    let cancel = CancelToken::new();
    let total = node.files.total_disk_size_used(&cancel)?;
    let (allocation, staged) = match allocation_id {
        Some(id) => (
            Some(node.files.allocation_disk_size_used(id, &cancel)?),
            Some(node.files.temp_path_size(id, &cancel)?),
        ),
        None => (None, None),
    };

    let output = DuOutput {
        success: true,
        result_code: 0,
        total,
        allocation,
        staged,
    };
    out.write(&output, || {
        let mut text = format!("total: {} bytes\n", output.total);
        if let (Some(a), Some(s)) = (output.allocation, output.staged) {
            text.push_str(&format!("allocation: {} bytes\nstaged: {} bytes\n", a, s));
        }
        text
    })
}

fn cmd_objects(node: &Node, allocation_id: &str, out: &OutputWriter) -> Result<()> {
    let mut objects = Vec::new();
    node.files
        .iterate_objects(allocation_id, &CancelToken::new(), |hash, size| {
            objects.push(ObjectInfo {
                hash: hash.to_string(),
                size,
            })
        })?;
    objects.sort_by(|a, b| a.hash.cmp(&b.hash));

    let output = ObjectsOutput {
        success: true,
        result_code: 0,
        objects,
    };
    out.write(&output, || {
        output
            .objects
            .iter()
            .map(|o| format!("{} {}\n", o.hash, o.size))
            .collect()
    })
}

fn cmd_lookup(node: &Node, allocation_id: &str, path: &str, out: &OutputWriter) -> Result<()> {
    let path = clean_path(path);
    let output = LookupOutput {
        success: true,
        result_code: 0,
        lookup_hash: reference_lookup(allocation_id, &path),
        ref_id: node.meta.get_ref(allocation_id, &path)?.map(|r| r.id),
        path,
    };
    out.write(&output, || match output.ref_id {
        Some(id) => format!("{} {} (ref {})\n", output.lookup_hash, output.path, id),
        None => format!("{} {} (not stored)\n", output.lookup_hash, output.path),
    })
}

#[allow(clippy::too_many_arguments)]
fn cmd_price(
    node: &Node,
    allocation_id: &str,
    client_id: &str,
    terms: &TermsArgs,
    blocks: i64,
    size: i64,
    reserve: bool,
    out: &OutputWriter,
) -> Result<()> {
    let now = now();
    let blobber_id = node.config.blobber_id.clone();
    let allocation = Allocation {
        id: allocation_id.to_string(),
        expiration: now.saturating_add(terms.expires_in),
        time_unit: Duration::from_secs(terms.time_unit),
        terms: vec![Terms {
            blobber_id: blobber_id.clone(),
            read_price: terms.read_price,
            write_price: terms.write_price,
        }],
    };

    let read_pools = node.meta.read_pools(client_id, allocation_id, &blobber_id, now)?;
    let write_pools = node.meta.write_pools(client_id, allocation_id, &blobber_id, now)?;
    let mut pending = get_pending(&node.meta, client_id, allocation_id, &blobber_id)?;

    let reserved = if reserve {
        let reservation = reserve_write(&node.meta, &allocation, client_id, &blobber_id, size, now)?;
        node.persist()?;
        pending = reservation.pending.clone();
        Some(reservation.is_funded())
    } else {
        None
    };

    let output = PriceOutput {
        success: true,
        result_code: 0,
        want_read: allocation.want_read(&blobber_id, blocks),
        want_write: allocation.want_write(&blobber_id, size, now),
        have_read: allocation.have_read(&read_pools, &blobber_id, blocks),
        have_write: pending.have_write(&write_pools, &allocation, now),
        pending_write: pending.pending_write,
        blobber_id,
        reserved,
    };
    out.write(&output, || {
        let mut text = format!(
            "read {} blocks: {} (left {})\nwrite {} bytes: {} (left {})\npending write: {}\n",
            blocks, output.want_read, output.have_read, size, output.want_write, output.have_write, output.pending_write
        );
        if let Some(funded) = output.reserved {
            text.push_str(if funded { "reserved\n" } else { "not funded, nothing reserved\n" });
        }
        text
    })
}

fn pool_info(kind: &str, pool_id: &str, balance: i64, expire_at: Timestamp) -> PoolInfo {
    PoolInfo {
        kind: kind.to_string(),
        pool_id: pool_id.to_string(),
        balance,
        expire_at,
        expire_at_human: DateTime::<Utc>::from_timestamp(expire_at, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    }
}

fn cmd_pool(node: &Node, allocation_id: &str, client_id: &str, cmd: &PoolCommands, out: &OutputWriter) -> Result<()> {
    let now = now();
    let blobber_id = node.config.blobber_id.clone();
    let pool_id = format!("{}:{}", client_id, allocation_id);

    match cmd {
        PoolCommands::Read { balance, expires_in } => {
            let pool = ReadPool {
                pool_id: pool_id.clone(),
                blobber_id: blobber_id.clone(),
                balance: *balance,
                expire_at: now.saturating_add(*expires_in),
                ..Default::default()
            };
            node.meta.set_read_pools(client_id, allocation_id, vec![pool])?;
            node.persist()?;
        }
        PoolCommands::Write { balance, expires_in } => {
            let pool = WritePool {
                pool_id: pool_id.clone(),
                blobber_id: blobber_id.clone(),
                balance: *balance,
                expire_at: now.saturating_add(*expires_in),
                ..Default::default()
            };
            node.meta.set_write_pools(client_id, allocation_id, vec![pool])?;
            node.persist()?;
        }
        PoolCommands::Show => {}
    }

    let mut pools: Vec<PoolInfo> = node
        .meta
        .read_pools(client_id, allocation_id, &blobber_id, now)?
        .iter()
        .map(|p| pool_info("read", &p.pool_id, p.balance, p.expire_at))
        .collect();
    pools.extend(
        node.meta
            .write_pools(client_id, allocation_id, &blobber_id, now)?
            .iter()
            .map(|p| pool_info("write", &p.pool_id, p.balance, p.expire_at)),
    );
    let pending = get_pending(&node.meta, client_id, allocation_id, &blobber_id)?;

    let output = PoolOutput {
        success: true,
        result_code: 0,
        pools,
        pending_write: pending.pending_write,
    };
    out.write(&output, || {
        let mut text: String = output
            .pools
            .iter()
            .map(|p| format!("{:<5} {} {} until {}\n", p.kind, p.pool_id, p.balance, p.expire_at_human))
            .collect();
        text.push_str(&format!("pending write: {}\n", output.pending_write));
        text
    })
}
