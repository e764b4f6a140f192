//! Output modules known to the engine.
//!
//! A [`Module`] ties a bus address to the items bound to its outputs and
//! remembers the last levels it reported. The engine finds modules through
//! the [`ModuleDirectory`] trait; [`ModuleRegistry`] is the in-memory
//! implementation used when the engine is embedded without a configuration
//! layer of its own.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace};

use nikobus_core::error::{Error, Result};
use nikobus_core::{Address, ChannelGroup, Command, EventSink, ModuleKind};
use nikobus_io::protocol;

/// Highest output number on a module.
pub const MAX_CHANNEL: u8 = 12;

pub struct Module {
    address: Address,
    kind: ModuleKind,
    bindings: BTreeMap<u8, String>,
    levels: Mutex<[u8; MAX_CHANNEL as usize]>,
    requested: Mutex<ChannelGroup>,
}

impl Module {
    pub fn new(address: Address, kind: ModuleKind) -> Self {
        Module {
            address,
            kind,
            bindings: BTreeMap::new(),
            levels: Mutex::new([0; MAX_CHANNEL as usize]),
            requested: Mutex::new(ChannelGroup::One),
        }
    }

    /// Bind output `channel` (1 to 12) to `item`.
    pub fn with_channel(mut self, channel: u8, item: impl Into<String>) -> Result<Self> {
        if ChannelGroup::for_channel(channel).is_none() {
            return Err(Error::InvalidParameter(format!(
                "channel {channel} out of range 1..={MAX_CHANNEL}"
            )));
        }
        self.bindings.insert(channel, item.into());
        Ok(self)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn item_for(&self, channel: u8) -> Option<&str> {
        self.bindings.get(&channel).map(String::as_str)
    }

    /// Channel groups that have at least one bound output.
    pub fn groups(&self) -> Vec<ChannelGroup> {
        let mut groups: Vec<ChannelGroup> = self
            .bindings
            .keys()
            .filter_map(|&channel| ChannelGroup::for_channel(channel))
            .collect();
        groups.dedup();
        groups
    }

    /// One status request per used channel group.
    pub fn status_requests(&self) -> Result<Vec<Command>> {
        self.groups()
            .into_iter()
            .map(|group| protocol::status_request(&self.address, group))
            .collect()
    }

    /// Remember which group the next `$1C` reply describes.
    ///
    /// Replies do not name their group, so the last request sent to the
    /// module decides it.
    pub fn set_requested_group(&self, group: ChannelGroup) {
        *self.requested.lock().unwrap_or_else(|p| p.into_inner()) = group;
    }

    /// Group of the last status request sent; group one until then.
    pub fn requested_group(&self) -> ChannelGroup {
        *self.requested.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Last reported level of `channel`, if it is in range.
    pub fn level(&self, channel: u8) -> Option<u8> {
        ChannelGroup::for_channel(channel)?;
        let levels = self.levels.lock().unwrap_or_else(|p| p.into_inner());
        Some(levels[channel as usize - 1])
    }

    /// Store the levels of one group and post every bound output to `sink`.
    pub fn apply_status(
        &self,
        group: ChannelGroup,
        group_levels: [u8; ChannelGroup::SIZE],
        sink: &dyn EventSink,
    ) {
        let first = group.first_channel();
        {
            let mut levels = self.levels.lock().unwrap_or_else(|p| p.into_inner());
            let start = first as usize - 1;
            levels[start..start + ChannelGroup::SIZE].copy_from_slice(&group_levels);
        }
        for (offset, level) in group_levels.iter().enumerate() {
            let channel = first + offset as u8;
            if let Some(item) = self.item_for(channel) {
                trace!(module = %self.address, channel, item, level, "posting level");
                sink.post_update(item, *level);
            }
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// Source of the modules the engine polls.
pub trait ModuleDirectory: Send + Sync {
    /// Snapshot of every known module, in a stable order.
    fn modules(&self) -> Vec<Arc<Module>>;

    fn module(&self, address: &Address) -> Option<Arc<Module>> {
        self.modules()
            .into_iter()
            .find(|module| module.address() == address)
    }
}

/// In-memory [`ModuleDirectory`].
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `module`, replacing any module with the same address.
    pub fn add(&self, module: Module) -> Arc<Module> {
        let module = Arc::new(module);
        let mut modules = self.modules.write().unwrap_or_else(|p| p.into_inner());
        match modules.iter_mut().find(|m| m.address() == module.address()) {
            Some(existing) => *existing = Arc::clone(&module),
            None => modules.push(Arc::clone(&module)),
        }
        debug!(address = %module.address(), kind = %module.kind(), "module added");
        module
    }

    pub fn remove(&self, address: &Address) -> bool {
        let mut modules = self.modules.write().unwrap_or_else(|p| p.into_inner());
        let before = modules.len();
        modules.retain(|m| m.address() != address);
        before != modules.len()
    }

    pub fn len(&self) -> usize {
        self.modules.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleDirectory for ModuleRegistry {
    fn modules(&self) -> Vec<Arc<Module>> {
        self.modules
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
