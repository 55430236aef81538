// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol root.
//!
//! A [`Protocol`] ties together everything a bound entity needs: the wire it
//! sends on, the scheduler it mutates on, the serializer registry, the id
//! allocator and the context values attached to queued frames. Top-level
//! entities are bound directly under it with [`Protocol::bind_top_level`];
//! extensions create nested protocols that share all of this except the wire.

use crate::bind::{BindOutcome, BindParent, Bindable};
use crate::config::ProtocolConfig;
use crate::core::{Identities, Lifetime, ProtocolContexts, RdId, Scheduler};
use crate::ser::Serializers;
use crate::wire::Wire;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

pub struct Protocol {
    name: String,
    config: ProtocolConfig,
    identities: Arc<Identities>,
    serializers: Arc<Serializers>,
    scheduler: Arc<dyn Scheduler>,
    wire: Arc<dyn Wire>,
    lifetime: Lifetime,
    contexts: Arc<ProtocolContexts>,
    /// Locations of extensions whose counterpart reported another schema hash
    out_of_sync: Mutex<Vec<String>>,
}

impl Protocol {
    /// Root protocol over `wire`.
    ///
    /// Unless `config.queue_messages_until_started` is set, the wire's broker
    /// is switched to immediate delivery here.
    pub fn new(
        config: ProtocolConfig,
        serializers: Arc<Serializers>,
        scheduler: Arc<dyn Scheduler>,
        wire: Arc<dyn Wire>,
        lifetime: Lifetime,
    ) -> Arc<Self> {
        if !config.queue_messages_until_started {
            wire.broker().start_delivering_messages();
        }
        log::debug!(
            target: "rdsync::init",
            "protocol `{}` created ({:?}, scheduler `{}`)",
            config.name,
            config.id_kind,
            scheduler.name()
        );
        Arc::new(Self {
            name: config.name.clone(),
            identities: Arc::new(Identities::new(config.id_kind)),
            config,
            serializers,
            scheduler,
            wire,
            lifetime,
            contexts: ProtocolContexts::new(),
            out_of_sync: Mutex::new(Vec::new()),
        })
    }

    /// Sub-protocol over another wire, sharing ids, serializers, scheduler and
    /// contexts with `self`.
    pub(crate) fn nested(&self, name: &str, wire: Arc<dyn Wire>, lifetime: Lifetime) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            config: ProtocolConfig {
                name: name.to_string(),
                ..self.config.clone()
            },
            identities: self.identities.clone(),
            serializers: self.serializers.clone(),
            scheduler: self.scheduler.clone(),
            wire,
            lifetime,
            contexts: self.contexts.clone(),
            out_of_sync: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn identities(&self) -> &Identities {
        &self.identities
    }

    pub fn serializers(&self) -> &Arc<Serializers> {
        &self.serializers
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn wire(&self) -> &Arc<dyn Wire> {
        &self.wire
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn contexts(&self) -> &Arc<ProtocolContexts> {
        &self.contexts
    }

    /// The client side is the master of shared state.
    pub fn is_master(&self) -> bool {
        self.config.id_kind.is_client()
    }

    /// Deliver frames held since creation, then switch to direct delivery.
    pub fn start_delivering_messages(&self) {
        self.wire.broker().start_delivering_messages();
    }

    /// Identify `entity` as `derive(null, name)` and bind it under this
    /// protocol's lifetime.
    pub fn bind_top_level(self: &Arc<Self>, entity: &dyn Bindable, name: &str) -> BindOutcome {
        entity.identify(&self.identities, Identities::derive(RdId::NULL, name));
        match entity.pre_bind(self.lifetime, BindParent::Protocol(self.clone()), name) {
            BindOutcome::Bound => entity.bind(),
            other => other,
        }
    }

    /// Locations of extensions flagged out of sync.
    pub fn out_of_sync_extensions(&self) -> Vec<String> {
        self.out_of_sync.lock().clone()
    }

    pub(crate) fn mark_out_of_sync(&self, location: &str) {
        let mut list = self.out_of_sync.lock();
        if !list.iter().any(|l| l == location) {
            list.push(location.to_string());
        }
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("id_kind", &self.config.id_kind)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::RdModel;
    use crate::core::{LifetimeDef, SynchronousScheduler};
    use crate::wire::{DirectWire, MessageBroker};

    #[test]
    fn test_top_level_id_is_name_hash() {
        let def = LifetimeDef::new();
        let (wire, _other) = DirectWire::pair();
        let proto = Protocol::new(
            ProtocolConfig::server("srv"),
            Arc::new(Serializers::new()),
            Arc::new(SynchronousScheduler),
            wire,
            def.lifetime(),
        );
        assert!(!proto.is_master());

        let model = RdModel::new();
        assert_eq!(proto.bind_top_level(model.as_ref(), "solution"), BindOutcome::Bound);
        assert_eq!(model.rd_id(), RdId::NULL.mix_str("solution"));
        assert_eq!(model.location(), "srv.solution");
        def.terminate();
    }

    #[test]
    fn test_queue_until_started() {
        let def = LifetimeDef::new();
        let (wire, _other) = DirectWire::pair_with(MessageBroker::held(), MessageBroker::new());
        let config = ProtocolConfig {
            queue_messages_until_started: true,
            ..ProtocolConfig::client("cli")
        };
        let proto = Protocol::new(
            config,
            Arc::new(Serializers::new()),
            Arc::new(SynchronousScheduler),
            wire.clone(),
            def.lifetime(),
        );
        assert!(!wire.broker().is_delivering());
        proto.start_delivering_messages();
        assert!(wire.broker().is_delivering());
        def.terminate();
    }
}
