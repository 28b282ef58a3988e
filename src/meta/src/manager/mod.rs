// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide context: the alive-node registry and the dependency bag that
//! subsystem constructors receive.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rivulet_common::NodeId;

use crate::messaging::MessageCenter;
use crate::metrics::MetaMetrics;

/// What the control plane knows about one server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub advertise_addr: String,
}

impl NodeInfo {
    pub fn new(id: NodeId, advertise_addr: impl Into<String>) -> Self {
        Self {
            id,
            advertise_addr: advertise_addr.into(),
        }
    }
}

type NodeChangeHandler = Box<dyn Fn(&HashMap<NodeId, NodeInfo>) + Send + Sync>;

/// Registry of alive nodes, fed by the membership watcher. Change handlers
/// only flip flags; the real diffing happens on each consumer's own loop.
#[derive(Default)]
pub struct NodeManager {
    alive: RwLock<HashMap<NodeId, NodeInfo>>,
    handlers: Mutex<HashMap<String, NodeChangeHandler>>,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_alive_nodes(&self) -> HashMap<NodeId, NodeInfo> {
        self.alive.read().clone()
    }

    pub fn is_alive(&self, node: &NodeId) -> bool {
        self.alive.read().contains_key(node)
    }

    pub fn register_node(&self, info: NodeInfo) {
        {
            let mut alive = self.alive.write();
            if alive.insert(info.id.clone(), info).is_some() {
                return;
            }
        }
        self.notify();
    }

    pub fn remove_node(&self, node: &NodeId) {
        {
            let mut alive = self.alive.write();
            if alive.remove(node).is_none() {
                return;
            }
        }
        self.notify();
    }

    pub fn register_node_change_handler(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&HashMap<NodeId, NodeInfo>) + Send + Sync + 'static,
    ) {
        self.handlers.lock().insert(name.into(), Box::new(handler));
    }

    pub fn unregister_node_change_handler(&self, name: &str) {
        self.handlers.lock().remove(name);
    }

    fn notify(&self) {
        let snapshot = self.get_alive_nodes();
        for handler in self.handlers.lock().values() {
            handler(&snapshot);
        }
    }
}

/// The dependency bag passed to every subsystem constructor: message egress,
/// node membership, metrics. Assembled once at server start.
#[derive(Clone)]
pub struct Env {
    pub message_center: Arc<dyn MessageCenter>,
    pub node_manager: Arc<NodeManager>,
    pub metrics: Arc<MetaMetrics>,
    /// The node this process runs on.
    pub self_node: NodeId,
}

impl Env {
    pub fn new(
        message_center: Arc<dyn MessageCenter>,
        node_manager: Arc<NodeManager>,
        metrics: Arc<MetaMetrics>,
        self_node: NodeId,
    ) -> Self {
        Self {
            message_center,
            node_manager,
            metrics,
            self_node,
        }
    }

    /// An env wired to a collecting message center, for tests.
    pub fn for_test(self_node: NodeId) -> (Self, Arc<crate::messaging::CollectingMessageCenter>) {
        let mc = Arc::new(crate::messaging::CollectingMessageCenter::new());
        let env = Self {
            message_center: mc.clone(),
            node_manager: Arc::new(NodeManager::new()),
            metrics: MetaMetrics::for_test(),
            self_node,
        };
        (env, mc)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_node_change_handler_fires_on_membership_change() {
        let manager = NodeManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        manager.register_node_change_handler("test", move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });

        let node = NodeId::from("node-1");
        manager.register_node(NodeInfo::new(node.clone(), "127.0.0.1:8300"));
        // Re-registering the same node is not a membership change.
        manager.register_node(NodeInfo::new(node.clone(), "127.0.0.1:8300"));
        manager.remove_node(&node);
        manager.remove_node(&node);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
