//! Test helpers: a temp-file store that a raw connection can tamper with.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flowkeeper_store::Store;

static NEXT: AtomicUsize = AtomicUsize::new(0);

/// Temp database file, removed on drop.
pub struct TempStore {
    pub path: PathBuf,
    pub store: Arc<Store>,
}

impl TempStore {
    pub fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "flowkeeper-{label}-{}-{}.db",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ));
        let store = Arc::new(Store::open(&path).unwrap());
        Self { path, store }
    }

    /// A second, independent connection to the same file.
    pub fn raw(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.path).unwrap()
    }

    /// Make every queue push for `org_id` fail until `restore_pushes`.
    pub fn fail_pushes_for(&self, org_id: i64) {
        self.raw()
            .execute_batch(&format!(
                "CREATE TRIGGER reject_org_{org_id} BEFORE INSERT ON queue_tasks
                 WHEN NEW.org_id = {org_id}
                 BEGIN SELECT RAISE(ABORT, 'handler queue unavailable'); END;"
            ))
            .unwrap();
    }

    pub fn restore_pushes(&self, org_id: i64) {
        self.raw()
            .execute_batch(&format!("DROP TRIGGER reject_org_{org_id};"))
            .unwrap();
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut p = self.path.clone().into_os_string();
            p.push(suffix);
            std::fs::remove_file(PathBuf::from(p)).ok();
        }
    }
}
