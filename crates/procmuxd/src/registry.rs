use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Everything the supervisor remembers about a live child.
#[derive(Debug, Clone)]
pub struct ChildEntry {
	pub pid: u32,
}

/// The table of in-flight children, keyed by tag.
///
/// A tag identifies at most one live child: insertion refuses duplicates and
/// the caller reports them as ill-formed. Entries leave the table after the
/// exit report, which is what lets the supervisor terminate.
#[derive(Clone)]
pub struct Registry {
	inner: Arc<RwLock<HashMap<u32, ChildEntry>>>,
}

impl Registry {
	pub fn new() -> Self {
		Self { inner: Arc::new(RwLock::new(HashMap::new())) }
	}

	/// Registers a child. Returns false (and changes nothing) when the tag
	/// is already live.
	pub async fn insert(&self, tag: u32, entry: ChildEntry) -> bool {
		let mut table = self.inner.write().await;
		if table.contains_key(&tag) {
			return false;
		}
		table.insert(tag, entry);
		true
	}

	pub async fn contains(&self, tag: u32) -> bool {
		self.inner.read().await.contains_key(&tag)
	}

	pub async fn remove(&self, tag: u32) -> Option<ChildEntry> {
		self.inner.write().await.remove(&tag)
	}

	pub async fn live_pids(&self) -> Vec<u32> {
		self.inner.read().await.values().map(|entry| entry.pid).collect()
	}

	pub async fn is_empty(&self) -> bool {
		self.inner.read().await.is_empty()
	}

	pub async fn len(&self) -> usize {
		self.inner.read().await.len()
	}
}

impl Default for Registry {
	fn default() -> Self {
		Self::new()
	}
}
