// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The broker's client table: who's connected, keyed by client id. Plays
//! the same role `ServerState` played for sessions, but a `ClientProxy`
//! carries its own state directly, so there's no separate cleanup pass --
//! removal happens synchronously on disconnect.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::proxy::ClientProxy;

/// Guarded by the broker's `list_and_timing_lock`. Append/remove-only;
/// iteration never needs to copy out, since removal holds the same lock.
pub struct BrokerState {
    clients: HashMap<u64, Arc<ClientProxy>>,
    next_client_id: u64,
}

impl BrokerState {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
        }
    }

    pub fn reserve_client_id(&mut self) -> u64 {
        let id = self.next_client_id;
        self.next_client_id += 1;
        id
    }

    pub fn insert(&mut self, proxy: Arc<ClientProxy>) {
        self.clients.insert(proxy.client_id, proxy);
    }

    pub fn remove(&mut self, client_id: u64) -> Option<Arc<ClientProxy>> {
        self.clients.remove(&client_id)
    }

    pub fn get(&self, client_id: u64) -> Option<&Arc<ClientProxy>> {
        self.clients.get(&client_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClientProxy>> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn active_count(&self) -> u64 {
        self.clients.values().filter(|p| p.session_active()).count() as u64
    }
}

impl Default for BrokerState {
    fn default() -> Self {
        Self::new()
    }
}
