use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::{CastResult, ObjectStorage};

const INDEX_NAME: &str = "index.html";

struct IndexState {
    names: HashSet<String>,
    dirty: bool,
}

/// Wraps a storage adapter with a membership set and a human-facing
/// `index.html` listing. Membership is tracked locally so `has` never
/// costs a round trip; the listing is regenerated by [`sync`] only when
/// something changed since the last regeneration.
///
/// Clones share state, so one store can be handed to several
/// collaborators in the driver loop.
///
/// [`sync`]: IndexedStore::sync
#[derive(Clone)]
pub struct IndexedStore {
    inner: Arc<dyn ObjectStorage>,
    state: Arc<Mutex<IndexState>>,
}

impl IndexedStore {
    pub fn new(inner: Arc<dyn ObjectStorage>) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(IndexState {
                names: HashSet::new(),
                dirty: false,
            })),
        }
    }

    /// The wrapped adapter, for writers of transient objects (chunks, the
    /// manifest) that must not churn the index listing.
    pub fn inner_store(&self) -> Arc<dyn ObjectStorage> {
        self.inner.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().unwrap().names.contains(name)
    }

    pub async fn write(&self, name: &str, data: &[u8]) -> CastResult<()> {
        self.inner.write(name, data).await?;
        let mut state = self.state.lock().unwrap();
        if state.names.insert(name.to_string()) {
            state.dirty = true;
        }
        Ok(())
    }

    pub async fn delete(&self, names: &[String]) -> CastResult<()> {
        self.inner.delete(names).await?;
        let mut state = self.state.lock().unwrap();
        for name in names {
            if state.names.remove(name) {
                state.dirty = true;
            }
        }
        Ok(())
    }

    /// Rewrites `index.html` if anything was written or deleted since the
    /// last sync. The listing is for humans browsing the bucket and plays
    /// no part in the wire contract.
    pub async fn sync(&self) -> CastResult<()> {
        let listing = {
            let mut state = self.state.lock().unwrap();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            let mut names = state.names.iter().cloned().collect::<Vec<String>>();
            names.sort();
            names
        };
        let html = render_index(&listing);
        self.inner.write(INDEX_NAME, html.as_bytes()).await?;
        debug!("IndexedStore: index.html rewritten ({} entries)", listing.len());
        Ok(())
    }
}

fn render_index(names: &[String]) -> String {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>index</title></head><body>\n<ul>\n",
    );
    for name in names {
        html.push_str(&format!("<li><a href=\"{}\">{}</a></li>\n", name, name));
    }
    html.push_str("</ul>\n</body></html>\n");
    html
}
