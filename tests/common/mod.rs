#![allow(dead_code)]

use eventwire::config::{DdlAuto, JpaConfig};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// A SQLite file under the temp dir, removed (with its WAL files) on drop.
pub struct TempDb {
    pub path: PathBuf,
}

impl TempDb {
    pub fn new(label: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX_EPOCH")
            .as_nanos();
        let mut path = std::env::temp_dir();
        path.push(format!(
            "eventwire-{label}-{}-{}.sqlite",
            std::process::id(),
            nanos
        ));
        Self { path }
    }

    pub fn url(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    pub fn jpa(&self, ddl_auto: DdlAuto) -> JpaConfig {
        let mut jpa = JpaConfig::default();
        jpa.driver_class_name = "org.sqlite.JDBC".to_string();
        jpa.dialect = "SQLite".to_string();
        jpa.command.url = self.url();
        jpa.command.username = "sa".to_string();
        jpa.command.ddl_auto = Some(ddl_auto);
        jpa.non_contextual_creation = Some(false);
        jpa
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}
