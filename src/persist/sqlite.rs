use std::{fmt, path::Path};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use diesel::{Connection, RunQueryDsl, SqliteConnection, prelude::*};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{
    runtime::Builder,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::LocalSet,
};
use tracing::{debug, error, info};

use super::{KvStore, model::KvEntry, schema::kv_entry};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

enum Command {
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<String>>>,
    },
    Put {
        entry: KvEntry,
        reply: oneshot::Sender<Result<()>>,
    },
    Remove {
        key: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Get { key, .. } => write!(f, "Get({key})"),
            Command::Put { entry, .. } => write!(f, "Put({})", entry.store_key),
            Command::Remove { key, .. } => write!(f, "Remove({key})"),
        }
    }
}

/// SQLite-backed store. The connection lives on its own `persist` thread; this
/// handle only sends commands there, so it is cheap to clone.
#[derive(Clone)]
pub struct SqliteStore {
    cmd_tx: UnboundedSender<Command>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("creating {}", parent.display()))?;
        }
        let db_url = path.to_string_lossy().to_string();
        let handler = PersistHandler {
            conn: prepare_connection(&db_url)?,
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .wrap_err("building persist runtime")?;
        std::thread::Builder::new()
            .name("persist".into())
            .spawn(move || {
                let local = LocalSet::new();
                local.spawn_local(handler.run(cmd_rx));
                runtime.block_on(local);
            })
            .wrap_err("spawning persist thread")?;
        Ok(Self { cmd_tx })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .map_err(|_| eyre!("persist thread has shut down"))?;
        response
            .await
            .wrap_err("persist thread dropped the request")?
    }
}

impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.request(|reply| Command::Get { key, reply }).await
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        let entry = KvEntry {
            store_key: key.to_string(),
            value_json: value,
            updated_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
        };
        self.request(|reply| Command::Put { entry, reply }).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.request(|reply| Command::Remove { key, reply }).await
    }
}

fn prepare_connection(db_url: &str) -> Result<SqliteConnection> {
    let mut conn = SqliteConnection::establish(db_url)
        .wrap_err_with(|| format!("connecting to sqlite {db_url}"))?;

    debug!("Running any pending migrations now.");
    match conn.run_pending_migrations(MIGRATIONS) {
        Ok(migrations_run) => {
            for migration in migrations_run {
                info!("Schema migration run: {}", migration);
            }
        }
        Err(e) => Err(eyre!(e)).wrap_err_with(|| "running sqlite migrations")?,
    }
    Ok(conn)
}

struct PersistHandler {
    conn: SqliteConnection,
}

impl PersistHandler {
    async fn run(mut self, mut cmd_rx: UnboundedReceiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            debug!("Persistence command: {cmd:?}");
            self.handle(cmd);
        }
        debug!("All store handles dropped, shutting down persist handler...");
    }

    fn handle(&mut self, cmd: Command) {
        let delivered = match cmd {
            Command::Get { key, reply } => reply.send(self.get(&key)).is_ok(),
            Command::Put { entry, reply } => reply.send(self.put(&entry)).is_ok(),
            Command::Remove { key, reply } => reply.send(self.remove(&key)).is_ok(),
        };
        if !delivered {
            error!("Caller went away before the persistence result arrived");
        }
    }

    fn get(&mut self, key: &str) -> Result<Option<String>> {
        kv_entry::table
            .filter(kv_entry::store_key.eq(key))
            .select(KvEntry::as_select())
            .get_result(&mut self.conn)
            .optional()
            .map(|entry| entry.map(|it| it.value_json))
            .wrap_err_with(|| format!("load {key}"))
    }

    fn put(&mut self, entry: &KvEntry) -> Result<()> {
        diesel::insert_into(kv_entry::table)
            .values(entry)
            .on_conflict(kv_entry::store_key)
            .do_update()
            .set(entry)
            .execute(&mut self.conn)
            .wrap_err_with(|| format!("saving {}", entry.store_key))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        diesel::delete(kv_entry::table.filter(kv_entry::store_key.eq(key)))
            .execute(&mut self.conn)
            .wrap_err_with(|| format!("delete {key}"))?;
        Ok(())
    }
}
