// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Generic model node: a bindable container of named children.

use super::{BindableBase, Bindable};
use std::sync::{Arc, Weak};

/// Bindable node with ordered named children (models, signals, calls,
/// extensions).
pub struct RdModel {
    base: BindableBase,
}

impl RdModel {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RdModel>| {
            let owner: Weak<dyn Bindable> = weak.clone();
            RdModel {
                base: BindableBase::new(owner),
            }
        })
    }

    /// Attach `child` under `name` (before binding).
    pub fn add_child<E: Bindable>(&self, name: &str, child: Arc<E>) -> Arc<E> {
        self.base.add_child(name, child)
    }

    pub fn child<E: Bindable>(&self, name: &str) -> Option<Arc<E>> {
        self.base.child(name)
    }

    /// See [`BindableBase::get_or_create_extension`].
    pub fn get_or_create_extension<E: Bindable>(
        &self,
        name: &str,
        create: impl FnOnce() -> Arc<E>,
    ) -> Arc<E> {
        self.base.get_or_create_extension(name, create)
    }
}

impl Bindable for RdModel {
    fn base(&self) -> &BindableBase {
        &self.base
    }
}
