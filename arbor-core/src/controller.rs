//! Multi-instance controller.
//!
//! The controller owns the content arena, every running instance, the
//! global variable table and the event bus. All commands run synchronously;
//! a host that drives it from several threads wraps it in a
//! [`SharedController`].

use crate::backend::SaveBackend;
use crate::content::Content;
use crate::context::Context;
use crate::document::{InstanceRecord, Limits, SaveDocument, SideTable, DOCUMENT_VERSION};
use crate::error::CoreError;
use crate::events::{AutomatonEvent, EventBus, EventFilter, EventRecord, Subscription};
use crate::identity::Resolution;
use crate::instance::{ActionInfo, Instance, Step};
use crate::node::NodeId;
use crate::pathfinder::{self, Path};
use crate::registry::VariantRegistry;
use crate::serializer::{self, LoadPass};
use crate::value::{Value, VarTable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Controller behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Emit per-step `debug!` traces of transition evaluation.
    pub debug_trace: bool,
    /// Save to `autosave_slot` after every transition that changes the
    /// current node.
    pub autosave_on_transition: bool,
    pub autosave_slot: String,
    pub event_history_len: usize,
    pub event_channel_capacity: usize,
    pub default_max_paths: usize,
    pub default_max_depth: usize,
    /// Write node trees into save documents. Without them, a load maps ids
    /// onto the content already registered.
    pub embed_node_trees: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            debug_trace: false,
            autosave_on_transition: false,
            autosave_slot: "autosave".to_string(),
            event_history_len: 256,
            event_channel_capacity: 1024,
            default_max_paths: 3,
            default_max_depth: 20,
            embed_node_trees: true,
        }
    }
}

pub type SharedController = Arc<Mutex<Controller>>;

pub struct Controller {
    content: Content,
    instances: BTreeMap<String, Instance>,
    globals: VarTable,
    events: EventBus,
    config: ControllerConfig,
    backend: Option<Box<dyn SaveBackend>>,
    registry: VariantRegistry,
    limits: Limits,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("nodes", &self.content.len())
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .field("globals", &self.globals.len())
            .field("config", &self.config)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(ControllerConfig::default())
    }
}

/// Builds the context for one step, moving the variable tables in.
fn step_context(globals: &mut VarTable, instance: &mut Instance, input: &str, params: VarTable, debug: bool) -> Context {
    Context::new(input)
        .with_params(params)
        .with_globals(std::mem::take(globals))
        .with_locals(std::mem::take(&mut instance.locals))
        .with_debug(debug)
}

/// Moves the variable tables back out of a finished context.
fn commit_context(globals: &mut VarTable, instance: &mut Instance, ctx: Context) {
    *globals = ctx.globals;
    instance.locals = ctx.locals;
}

fn run_step(content: &Content, instance: &mut Instance, ctx: &mut Context) -> Result<Option<Step>, CoreError> {
    if !instance.is_initialized() {
        instance.initialize(content, ctx)?;
    }
    instance.process(content, ctx)
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Self {
        Self::with_content(Content::new(), config)
    }

    pub fn with_content(content: Content, config: ControllerConfig) -> Self {
        Self {
            content,
            instances: BTreeMap::new(),
            globals: VarTable::new(),
            events: EventBus::new(config.event_channel_capacity, config.event_history_len),
            config,
            backend: None,
            registry: VariantRegistry::new(),
            limits: Limits::default(),
        }
    }

    pub fn into_shared(self) -> SharedController {
        Arc::new(Mutex::new(self))
    }

    pub fn set_backend(&mut self, backend: Box<dyn SaveBackend>) {
        self.backend = Some(backend);
    }

    pub fn with_backend(mut self, backend: Box<dyn SaveBackend>) -> Self {
        self.set_backend(backend);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Authoring access. Call [`Controller::register_system`] or
    /// [`Content::assign_persistent_ids`] after structural edits.
    pub fn content_mut(&mut self) -> &mut Content {
        &mut self.content
    }

    pub fn registry_mut(&mut self) -> &mut VariantRegistry {
        &mut self.registry
    }

    pub fn set_limits(&mut self, limits: Limits) {
        self.limits = limits;
    }

    pub fn register_system(&mut self, name: &str, root: NodeId) -> Result<(), CoreError> {
        self.content.register_system(name, root)
    }

    // --- instances -------------------------------------------------------

    pub fn try_create_instance(&mut self, name: &str, system: &str) -> Result<(), CoreError> {
        if self.instances.contains_key(name) {
            return Err(CoreError::InstanceExists {
                instance: name.to_string(),
            });
        }
        let root = self
            .content
            .system_root(system)
            .ok_or_else(|| CoreError::SystemNotFound {
                system: system.to_string(),
            })?;
        self.instances
            .insert(name.to_string(), Instance::new(name, system, root));
        info!(instance = %name, system = %system, "created instance");
        self.events.publish(AutomatonEvent::Created {
            instance: name.to_string(),
        });
        Ok(())
    }

    pub fn create_instance(&mut self, name: &str, system: &str) -> bool {
        match self.try_create_instance(name, system) {
            Ok(()) => true,
            Err(e) => {
                warn!(instance = %name, system = %system, error = %e, "create_instance failed");
                false
            }
        }
    }

    pub fn destroy_instance(&mut self, name: &str) -> bool {
        if self.instances.remove(name).is_none() {
            warn!(instance = %name, "destroy_instance: instance not found");
            return false;
        }
        info!(instance = %name, "destroyed instance");
        self.events.publish(AutomatonEvent::Destroyed {
            instance: name.to_string(),
        });
        true
    }

    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.get(name)
    }

    pub fn instance_names(&self) -> impl Iterator<Item = &str> {
        self.instances.keys().map(String::as_str)
    }

    fn instance_mut(&mut self, name: &str) -> Result<&mut Instance, CoreError> {
        self.instances
            .get_mut(name)
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance: name.to_string(),
            })
    }

    /// Feeds one input to an instance. Returns the step taken, if any.
    pub fn try_process_input(&mut self, name: &str, input: &str, params: VarTable) -> Result<Option<Step>, CoreError> {
        let debug_trace = self.config.debug_trace;
        let instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance: name.to_string(),
            })?;

        let mut ctx = step_context(&mut self.globals, instance, input, params, debug_trace);
        let result = run_step(&self.content, instance, &mut ctx);
        commit_context(&mut self.globals, instance, ctx);
        let step = result?;

        if let Some(step) = &step {
            let from = self.pid(step.from);
            let to = self.pid(step.to);
            debug!(instance = %name, from = %from, to = %to, transition = %step.transition_name, "transition taken");
            self.announce_step(name, step, from, to);
        }
        Ok(step)
    }

    /// Publishes and autosaves a step that changed the current node. A self
    /// transition still runs its actions but is not announced.
    fn announce_step(&mut self, name: &str, step: &Step, from: String, to: String) {
        if step.from == step.to {
            return;
        }
        self.events.publish(AutomatonEvent::Transitioned {
            instance: name.to_string(),
            from,
            to,
            transition: step.transition_name.clone(),
        });
        self.autosave();
    }

    /// Feeds one input to an instance; true when a transition was taken.
    pub fn process_input(&mut self, name: &str, input: &str, params: VarTable) -> bool {
        match self.try_process_input(name, input, params) {
            Ok(step) => step.is_some(),
            Err(e) => {
                warn!(instance = %name, input = %input, error = %e, "process_input failed");
                false
            }
        }
    }

    fn autosave(&mut self) {
        if !self.config.autosave_on_transition {
            return;
        }
        let slot = self.config.autosave_slot.clone();
        if !self.save(&slot) {
            warn!(slot = %slot, "autosave failed");
        }
    }

    fn pid(&self, id: NodeId) -> String {
        self.content
            .node(id)
            .map(|n| n.persistent_id.clone())
            .unwrap_or_default()
    }

    /// Read-only context for status queries.
    fn peek_context(&self, instance: &Instance) -> Context {
        Context::new("")
            .with_globals(self.globals.clone())
            .with_locals(instance.locals.clone())
            .with_debug(self.config.debug_trace)
    }

    pub fn available_actions(&self, name: &str) -> Vec<ActionInfo> {
        let Some(instance) = self.instances.get(name) else {
            warn!(instance = %name, "available_actions: instance not found");
            return Vec::new();
        };
        let ctx = self.peek_context(instance);
        instance.available_actions(&self.content, &ctx)
    }

    /// Position used for graph queries; an uninitialized instance is at its root.
    fn position(&self, name: &str) -> Option<NodeId> {
        let instance = self.instances.get(name)?;
        Some(instance.current.unwrap_or(instance.root))
    }

    fn lookup_target(&self, target_id: &str) -> Option<NodeId> {
        self.content.find_by_pid(target_id)
    }

    pub fn can_reach_state(&self, name: &str, target_id: &str) -> bool {
        let (Some(start), Some(target)) = (self.position(name), self.lookup_target(target_id)) else {
            warn!(instance = %name, target = %target_id, "can_reach_state: instance or node not found");
            return false;
        };
        pathfinder::can_reach(&self.content, start, target)
    }

    /// Enumerates paths; `None` limits use the configured defaults.
    pub fn find_paths_to_state(
        &self,
        name: &str,
        target_id: &str,
        max_paths: Option<usize>,
        max_depth: Option<usize>,
    ) -> Vec<Path> {
        let (Some(start), Some(target)) = (self.position(name), self.lookup_target(target_id)) else {
            warn!(instance = %name, target = %target_id, "find_paths_to_state: instance or node not found");
            return Vec::new();
        };
        pathfinder::find_paths(
            &self.content,
            start,
            target,
            max_paths.unwrap_or(self.config.default_max_paths),
            max_depth.unwrap_or(self.config.default_max_depth),
        )
    }

    fn force_to(&mut self, name: &str, target: NodeId) -> Result<Step, CoreError> {
        let debug_trace = self.config.debug_trace;
        let instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance: name.to_string(),
            })?;
        let mut ctx = step_context(&mut self.globals, instance, "", VarTable::new(), debug_trace);
        let result = instance.force_transition(&self.content, &mut ctx, target);
        commit_context(&mut self.globals, instance, ctx);
        let step = result?;

        let from = self.pid(step.from);
        let to = self.pid(step.to);
        info!(instance = %name, from = %from, to = %to, "forced transition");
        self.announce_step(name, &step, from, to);
        Ok(step)
    }

    pub fn force_transition(&mut self, name: &str, target_id: &str) -> bool {
        let Some(target) = self.lookup_target(target_id) else {
            warn!(instance = %name, target = %target_id, "force_transition: node not found");
            return false;
        };
        match self.force_to(name, target) {
            Ok(_) => true,
            Err(e) => {
                warn!(instance = %name, target = %target_id, error = %e, "force_transition failed");
                false
            }
        }
    }

    /// Forces a transition to the first node named `node_name` in the
    /// instance's system.
    pub fn force_transition_by_name(&mut self, name: &str, node_name: &str) -> bool {
        let Some(root) = self.instances.get(name).map(|i| i.root) else {
            warn!(instance = %name, "force_transition_by_name: instance not found");
            return false;
        };
        let target = self
            .content
            .system_nodes(root)
            .into_iter()
            .find(|id| self.content.node(*id).map(|n| n.name == node_name).unwrap_or(false));
        let Some(target) = target else {
            warn!(instance = %name, node = %node_name, "force_transition_by_name: node not found");
            return false;
        };
        match self.force_to(name, target) {
            Ok(_) => true,
            Err(e) => {
                warn!(instance = %name, node = %node_name, error = %e, "force_transition_by_name failed");
                false
            }
        }
    }

    pub fn try_reset_instance(&mut self, name: &str) -> Result<(), CoreError> {
        let debug_trace = self.config.debug_trace;
        let instance = self
            .instances
            .get_mut(name)
            .ok_or_else(|| CoreError::InstanceNotFound {
                instance: name.to_string(),
            })?;
        let mut ctx = step_context(&mut self.globals, instance, "", VarTable::new(), debug_trace);
        let result = instance.reset(&self.content, &mut ctx);
        commit_context(&mut self.globals, instance, ctx);
        result?;
        info!(instance = %name, "reset instance");
        Ok(())
    }

    pub fn reset_instance(&mut self, name: &str) -> bool {
        match self.try_reset_instance(name) {
            Ok(()) => true,
            Err(e) => {
                warn!(instance = %name, error = %e, "reset_instance failed");
                false
            }
        }
    }

    /// Resets every instance; returns how many were reset.
    pub fn reset_all(&mut self) -> usize {
        let names: Vec<String> = self.instances.keys().cloned().collect();
        names.iter().filter(|name| self.reset_instance(name)).count()
    }

    pub fn current_node_id(&self, name: &str) -> Option<String> {
        let node = self.instances.get(name)?.current_node(&self.content)?;
        Some(node.persistent_id.clone())
    }

    pub fn current_node_name(&self, name: &str) -> Option<String> {
        let node = self.instances.get(name)?.current_node(&self.content)?;
        Some(node.name.clone())
    }

    // --- variables -------------------------------------------------------

    pub fn get_global_variable(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }

    pub fn set_global_variable(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    pub fn globals(&self) -> &VarTable {
        &self.globals
    }

    pub fn get_local_variable(&self, instance: &str, name: &str) -> Option<&Value> {
        self.instances.get(instance)?.locals.get(name)
    }

    pub fn set_local_variable(&mut self, instance: &str, name: impl Into<String>, value: Value) -> bool {
        match self.instance_mut(instance) {
            Ok(inst) => {
                inst.locals.insert(name.into(), value);
                true
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "set_local_variable failed");
                false
            }
        }
    }

    // --- events ----------------------------------------------------------

    pub fn subscribe(&mut self, filter: EventFilter) -> Subscription {
        self.events.subscribe(filter)
    }

    pub fn unsubscribe(&mut self, subscription_id: &str) -> bool {
        self.events.unsubscribe(subscription_id)
    }

    pub fn event_history(&self) -> impl Iterator<Item = &EventRecord> {
        self.events.history()
    }

    // --- persistence -----------------------------------------------------

    /// Captures every instance, the globals and the per-instance side data.
    /// Node trees, when enabled, are written once per system.
    pub fn save_document(&self) -> SaveDocument {
        let mut embedded: HashSet<&str> = HashSet::new();
        let mut side = SideTable {
            globals: self.globals.clone(),
            ..SideTable::default()
        };
        let instances: Vec<InstanceRecord> = self
            .instances
            .values()
            .map(|instance| {
                let embed = self.config.embed_node_trees && embedded.insert(instance.system.as_str());
                if !instance.locals.is_empty() {
                    side.locals.insert(instance.name.clone(), instance.locals.clone());
                }
                if !instance.completed.is_empty() {
                    side.completed
                        .insert(instance.name.clone(), instance.completed.iter().cloned().collect());
                }
                serializer::save_instance(&self.content, instance, embed)
            })
            .collect();

        SaveDocument {
            version: DOCUMENT_VERSION,
            instances,
            side,
        }
    }

    /// Replaces controller state with a document. On error nothing changes.
    pub fn load_document(&mut self, doc: &SaveDocument) -> Result<(), CoreError> {
        self.limits.check_document(doc)?;

        let mut scratch = self.rebuild_content(doc)?;

        let mut instances = BTreeMap::new();
        for record in &doc.instances {
            let (mut instance, resolution) = serializer::restore_instance(&mut scratch, record, &self.limits)?;
            if let Resolution::Fallback(_) = resolution {
                warn!(instance = %record.name, node = %record.current_node_id, "current node restored to system root");
            }
            if let Some(locals) = doc.side.locals.get(&record.name) {
                instance.locals = locals.clone();
            }
            if let Some(completed) = doc.side.completed.get(&record.name) {
                instance.completed = completed.iter().cloned().collect::<BTreeSet<_>>();
            }
            if instances.insert(record.name.clone(), instance).is_some() {
                return Err(CoreError::CorruptData {
                    reason: format!("instance '{}' appears twice", record.name),
                });
            }
        }

        // Commit.
        let previous: Vec<String> = std::mem::take(&mut self.instances).into_keys().collect();
        self.content = scratch;
        self.instances = instances;
        self.globals = doc.side.globals.clone();

        for name in previous {
            self.events.publish(AutomatonEvent::Destroyed { instance: name });
        }
        let loaded: Vec<String> = self.instances.keys().cloned().collect();
        for name in loaded {
            self.events.publish(AutomatonEvent::Loaded { instance: name });
        }
        info!(instances = self.instances.len(), nodes = self.content.len(), "loaded document");
        Ok(())
    }

    /// Builds the content a document will run against. Systems with an
    /// embedded tree are rebuilt from it; every other system is copied from
    /// the live content. Both go through the same two-phase resolution.
    fn rebuild_content(&self, doc: &SaveDocument) -> Result<Content, CoreError> {
        let mut trees: BTreeMap<&str, &[crate::document::NodeRecord]> = BTreeMap::new();
        for record in &doc.instances {
            if let Some(nodes) = &record.nodes {
                trees.entry(record.system.as_str()).or_insert(nodes.as_slice());
            }
        }
        if trees.is_empty() {
            return Ok(self.content.clone());
        }

        let mut scratch = Content::new();
        let mut passes: Vec<(String, LoadPass)> = Vec::new();
        for (system, records) in &trees {
            let pass = serializer::load_nodes(&mut scratch, records, &self.registry, &self.limits)?;
            passes.push((system.to_string(), pass));
        }
        for (system, root) in self.content.systems() {
            if !trees.contains_key(system) {
                let pass = serializer::copy_nodes(&mut scratch, &self.content, root)?;
                passes.push((system.to_string(), pass));
            }
        }

        for (system, pass) in &passes {
            scratch.register_system(system.as_str(), pass.root)?;
        }
        let unresolved = serializer::resolve_all(&mut scratch, passes.into_iter().map(|(_, pass)| pass).collect());
        if unresolved > 0 {
            warn!(unresolved, "transitions left without a target after load");
        }
        scratch.assign_persistent_ids();
        Ok(scratch)
    }

    pub fn try_save(&self, slot: &str) -> Result<(), CoreError> {
        let backend = self.backend.as_ref().ok_or(CoreError::NoBackend)?;
        let doc = self.save_document();
        backend.write(slot, &doc)?;
        info!(slot = %slot, instances = doc.instances.len(), "saved");
        Ok(())
    }

    pub fn save(&self, slot: &str) -> bool {
        match self.try_save(slot) {
            Ok(()) => true,
            Err(e) => {
                error!(slot = %slot, error = %e, "save failed");
                false
            }
        }
    }

    pub fn try_load(&mut self, slot: &str) -> Result<(), CoreError> {
        let backend = self.backend.as_ref().ok_or(CoreError::NoBackend)?;
        if !backend.exists(slot) {
            return Err(CoreError::Backend(format!("slot not found: {}", slot)));
        }
        let doc = backend.read(slot)?;
        self.load_document(&doc)
    }

    pub fn load(&mut self, slot: &str) -> bool {
        match self.try_load(slot) {
            Ok(()) => true,
            Err(e) if e.is_corruption() => {
                warn!(slot = %slot, error = %e, "save data rejected; state unchanged");
                false
            }
            Err(e) => {
                error!(slot = %slot, error = %e, "load failed");
                false
            }
        }
    }
}
