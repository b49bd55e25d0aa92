//! Command parsing and execution for the interactive shell.
use anyhow::Result;
use kvstore::IndexedStore;

/// What the read loop should do after a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Print the lines and keep reading.
    Continue(Vec<String>),
    /// Print the lines and stop.
    Exit(Vec<String>),
}

/// Runs shell commands against one store.
pub struct Shell {
    store: IndexedStore,
}

impl Shell {
    pub fn new(store: IndexedStore) -> Self {
        Self { store }
    }

    /// Executes one input line. Failures of a command are reported as
    /// `ERR ...` lines, never as an error of the shell itself.
    pub fn execute(&self, line: &str) -> Outcome {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Outcome::Continue(Vec::new());
        };
        let args: Vec<&str> = parts.collect();
        let lines = match cmd.to_uppercase().as_str() {
            "PUT" | "SET" => self.put(&args),
            "GET" => self.get(&args),
            "DEL" => self.delete(&args),
            "COMMIT" => self.commit(&args),
            "MERGE" => self.merge(),
            "STATS" => Ok(self.stats()),
            "VERIFY" => self.verify(),
            "EXIT" | "QUIT" => {
                return Outcome::Exit(vec!["bye".to_string()]);
            }
            other => Ok(vec![format!("unknown command: {}", other)]),
        };
        Outcome::Continue(lines.unwrap_or_else(|e| vec![format!("ERR {:#}", e)]))
    }

    fn put(&self, args: &[&str]) -> Result<Vec<String>> {
        let [key, words @ ..] = args else {
            return Ok(usage("PUT key value"));
        };
        if words.is_empty() {
            return Ok(usage("PUT key value"));
        }
        let key = parse_key(key)?;
        let value = words.join(" ");
        self.ensure_session()?;
        self.store.put(key, value.as_bytes())?;
        Ok(vec!["OK".to_string()])
    }

    fn get(&self, args: &[&str]) -> Result<Vec<String>> {
        let [key] = args else {
            return Ok(usage("GET key"));
        };
        let line = match self.store.get(parse_key(key)?)? {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => "(nil)".to_string(),
        };
        Ok(vec![line])
    }

    fn delete(&self, args: &[&str]) -> Result<Vec<String>> {
        let [key] = args else {
            return Ok(usage("DEL key"));
        };
        let key = parse_key(key)?;
        self.ensure_session()?;
        self.store.delete(key)?;
        Ok(vec!["OK".to_string()])
    }

    /// `COMMIT` keeps every key valid; `COMMIT min max` narrows the range.
    fn commit(&self, args: &[&str]) -> Result<Vec<String>> {
        let (min, max) = match args {
            [] => (0, self.store.capacity() - 1),
            [min, max] => (parse_key(min)?, parse_key(max)?),
            _ => return Ok(usage("COMMIT [min_key max_key]")),
        };
        if !self.store.is_writing() {
            return Ok(vec!["OK (nothing to commit)".to_string()]);
        }
        self.store.end_writing(min, max)?;
        Ok(vec![format!(
            "OK (files={}, keys={})",
            self.store.collection().file_count(),
            self.store.len()
        )])
    }

    fn merge(&self) -> Result<Vec<String>> {
        if self.store.is_writing() {
            return Ok(vec!["ERR commit the open session before merging".to_string()]);
        }
        let report = self.store.merge()?;
        if report.is_noop() {
            return Ok(vec!["OK (nothing to merge)".to_string()]);
        }
        Ok(vec![format!(
            "OK (merged={}, created={}, copied={}, dropped={})",
            report.files_merged, report.files_created, report.records_copied, report.records_dropped
        )])
    }

    fn stats(&self) -> Vec<String> {
        let (min, max) = self.store.valid_key_range();
        vec![
            format!("store: {}", self.store.name()),
            format!("capacity: {}", self.store.capacity()),
            format!("keys: {}", self.store.len()),
            format!("files: {}", self.store.collection().file_count()),
            format!("valid range: {}..={}", min, max),
            format!("writing: {}", self.store.is_writing()),
        ]
    }

    fn verify(&self) -> Result<Vec<String>> {
        if self.store.is_writing() {
            return Ok(vec!["ERR commit the open session before verifying".to_string()]);
        }
        let report = self.store.verify_index()?;
        if report.is_consistent() {
            return Ok(vec![format!("OK (live keys={})", report.live_keys)]);
        }
        Ok(vec![format!(
            "MISMATCH (live keys={}, mismatched={}, unindexed={})",
            report.live_keys,
            report.mismatched.len(),
            report.unindexed_keys
        )])
    }

    fn ensure_session(&self) -> Result<()> {
        if !self.store.is_writing() {
            self.store.start_writing()?;
        }
        Ok(())
    }

    /// Commits pending writes and saves the store.
    pub fn close(&self) -> Result<()> {
        self.store.close()
    }
}

fn parse_key(raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .map_err(|_| anyhow::anyhow!("key must be an unsigned integer, got {:?}", raw))
}

fn usage(text: &str) -> Vec<String> {
    vec![format!("ERR usage: {}", text)]
}
