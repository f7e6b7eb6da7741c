use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::content::types::{NewPost, Post, Service};
use crate::db::Database;

const POST_COLUMNS: &str = "id, title, slug, excerpt, service, author, published_at";

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const ABANDONED: u8 = 3;

/// Interrupts or skips a database call whose caller went away, typically
/// because the live timeout fired. Without it the call would keep the
/// connection locked for reads that are still wanted.
struct AbandonGuard {
  state: Arc<AtomicU8>,
  interrupt: Arc<InterruptHandle>,
}

impl Drop for AbandonGuard {
  fn drop(&mut self) {
    // Queued calls see the flag and skip; finished ones need nothing
    if self.state.swap(ABANDONED, Ordering::SeqCst) == RUNNING {
      self.interrupt.interrupt();
    }
  }
}

/// Live content source backed by the content database.
///
/// SQLite calls are blocking, so each one runs on the blocking pool. A call
/// dropped before it finishes is interrupted, so the next one is not stuck
/// behind it.
#[derive(Clone)]
pub struct ContentClient {
  db: Arc<Mutex<Database>>,
  interrupt: Arc<InterruptHandle>,
}

impl ContentClient {
  pub fn new(db: Database) -> Self {
    let interrupt = Arc::new(db.conn().get_interrupt_handle());
    Self {
      db: Arc::new(Mutex::new(db)),
      interrupt,
    }
  }

  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self::new(Database::open(path)?))
  }

  async fn with_conn<R, F>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let state = Arc::new(AtomicU8::new(QUEUED));
    let _guard = AbandonGuard {
      state: Arc::clone(&state),
      interrupt: Arc::clone(&self.interrupt),
    };

    let db = Arc::clone(&self.db);
    tokio::task::spawn_blocking(move || {
      let db = db.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      if state
        .compare_exchange(QUEUED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
      {
        return Err(eyre!("Database call abandoned before it started"));
      }
      let result = f(db.conn());
      // Marked done while the lock is still held
      let _ = state.compare_exchange(RUNNING, DONE, Ordering::SeqCst, Ordering::SeqCst);
      result
    })
    .await
    .map_err(|e| eyre!("Database task failed: {}", e))?
  }

  /// Cheap round trip used by the connectivity monitor
  pub async fn ping(&self) -> Result<()> {
    self
      .with_conn(|conn| {
        conn
          .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
          .map_err(|e| eyre!("Database ping failed: {}", e))?;
        Ok(())
      })
      .await
  }

  /// All posts, newest first
  pub async fn list_posts(&self) -> Result<Vec<Post>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare(&format!(
            "SELECT {} FROM posts ORDER BY published_at DESC, id DESC",
            POST_COLUMNS
          ))
          .map_err(|e| eyre!("Failed to prepare posts query: {}", e))?;
        let posts = stmt
          .query_map([], post_from_row)
          .map_err(|e| eyre!("Failed to query posts: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read post: {}", e))?;
        Ok(posts)
      })
      .await
  }

  /// Posts for one service, newest first
  pub async fn posts_by_service(&self, service: &str) -> Result<Vec<Post>> {
    let service = service.to_string();
    self
      .with_conn(move |conn| {
        let mut stmt = conn
          .prepare(&format!(
            "SELECT {} FROM posts WHERE service = ? ORDER BY published_at DESC, id DESC",
            POST_COLUMNS
          ))
          .map_err(|e| eyre!("Failed to prepare posts query: {}", e))?;
        let posts = stmt
          .query_map(params![service], post_from_row)
          .map_err(|e| eyre!("Failed to query posts for {}: {}", service, e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read post: {}", e))?;
        Ok(posts)
      })
      .await
  }

  /// A single post by id
  pub async fn get_post(&self, id: i64) -> Result<Post> {
    self
      .with_conn(move |conn| {
        conn
          .query_row(
            &format!("SELECT {} FROM posts WHERE id = ?", POST_COLUMNS),
            params![id],
            post_from_row,
          )
          .optional()
          .map_err(|e| eyre!("Failed to get post {}: {}", id, e))?
          .ok_or_else(|| eyre!("Post {} not found", id))
      })
      .await
  }

  /// All services, by name
  pub async fn list_services(&self) -> Result<Vec<Service>> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT slug, name, description FROM services ORDER BY name")
          .map_err(|e| eyre!("Failed to prepare services query: {}", e))?;
        let services = stmt
          .query_map([], |row| {
            Ok(Service {
              slug: row.get(0)?,
              name: row.get(1)?,
              description: row.get(2)?,
            })
          })
          .map_err(|e| eyre!("Failed to query services: {}", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| eyre!("Failed to read service: {}", e))?;
        Ok(services)
      })
      .await
  }

  /// Insert a post, stamped with the current time
  pub async fn create_post(&self, post: NewPost) -> Result<Post> {
    self
      .with_conn(move |conn| {
        let published_at = Utc::now();
        conn
          .execute(
            "INSERT INTO posts (title, slug, excerpt, service, author, published_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
              post.title,
              post.slug,
              post.excerpt,
              post.service,
              post.author,
              published_at.to_rfc3339()
            ],
          )
          .map_err(|e| eyre!("Failed to create post {}: {}", post.slug, e))?;

        Ok(Post {
          id: conn.last_insert_rowid(),
          title: post.title,
          slug: post.slug,
          excerpt: post.excerpt,
          service: post.service,
          author: post.author,
          published_at,
        })
      })
      .await
  }

  /// Insert services and posts that are not already present. Returns the
  /// number of rows written. All or nothing: a failed insert rolls back.
  pub async fn seed(&self, services: Vec<Service>, posts: Vec<Post>) -> Result<usize> {
    self
      .with_conn(move |conn| {
        // Rolls back on drop unless committed
        let tx = conn
          .unchecked_transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        let mut written = 0;
        for service in &services {
          written += tx
            .execute(
              "INSERT OR IGNORE INTO services (slug, name, description) VALUES (?, ?, ?)",
              params![service.slug, service.name, service.description],
            )
            .map_err(|e| eyre!("Failed to seed service {}: {}", service.slug, e))?;
        }
        for post in &posts {
          written += tx
            .execute(
              "INSERT OR IGNORE INTO posts (id, title, slug, excerpt, service, author, published_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)",
              params![
                post.id,
                post.title,
                post.slug,
                post.excerpt,
                post.service,
                post.author,
                post.published_at.to_rfc3339()
              ],
            )
            .map_err(|e| eyre!("Failed to seed post {}: {}", post.slug, e))?;
        }

        tx.commit().map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(written)
      })
      .await
  }
}

#[cfg(test)]
impl ContentClient {
  /// Run raw SQL against the database.
  pub(crate) async fn execute_batch(&self, sql: &'static str) -> Result<()> {
    self
      .with_conn(move |conn| {
        conn
          .execute_batch(sql)
          .map_err(|e| eyre!("Failed to execute batch: {}", e))
      })
      .await
  }

  /// Run a query returning a single integer.
  pub(crate) async fn query_scalar(&self, sql: &'static str) -> Result<i64> {
    self
      .with_conn(move |conn| {
        conn
          .query_row(sql, [], |row| row.get(0))
          .map_err(|e| eyre!("Query failed: {}", e))
      })
      .await
  }
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<Post> {
  let published_at: String = row.get(6)?;
  let published_at = DateTime::parse_from_rfc3339(&published_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

  Ok(Post {
    id: row.get(0)?,
    title: row.get(1)?,
    slug: row.get(2)?,
    excerpt: row.get(3)?,
    service: row.get(4)?,
    author: row.get(5)?,
    published_at,
  })
}
