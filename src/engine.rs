//! Engines (named plugin groups) and the global priority/brief/folder
//! registrar.
//!
//! Ports `examples/original_source/engine.go` and `register.go`.

use crate::matcher::{Matcher, MatcherRegistry, TypeRule};
use crate::rule::{Handler, Rule};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Options passed to [`Registrar::register`].
#[derive(Clone, Default)]
pub struct ServiceOptions {
    pub custom_priority: Option<i64>,
    pub default_block: bool,
    pub brief: Option<String>,
    pub extra: Option<i16>,
    pub public_data_folder: Option<String>,
    pub private_data_folder: Option<String>,
    pub default_disable: bool,
    /// Overrides the runtime's configured `CommandRule` prefix for this
    /// service alone. `None` inherits `Config::command_prefix`.
    pub command_prefix: Option<String>,
}

/// A named plugin group: owns pre/mid/post handlers applied around every
/// matcher it registers, and a unique numeric dispatch priority.
pub struct Engine {
    pub service: String,
    pub priority: i64,
    pub data_folder: PathBuf,
    pub default_block: bool,
    pub command_prefix: String,
    pre_handlers: Mutex<Vec<Rule>>,
    mid_handlers: Mutex<Vec<Rule>>,
    post_handlers: Mutex<Vec<Handler>>,
}

impl Engine {
    pub fn pre_handlers(&self) -> Vec<Rule> {
        self.pre_handlers.lock().unwrap().clone()
    }

    pub fn mid_handlers(&self) -> Vec<Rule> {
        self.mid_handlers.lock().unwrap().clone()
    }

    pub fn post_handlers(&self) -> Vec<Handler> {
        self.post_handlers.lock().unwrap().clone()
    }

    pub fn use_pre_handler(&self, rule: Rule) {
        self.pre_handlers.lock().unwrap().push(rule);
    }

    pub fn use_mid_handler(&self, rule: Rule) {
        self.mid_handlers.lock().unwrap().push(rule);
    }

    pub fn use_post_handler(&self, handler: Handler) {
        self.post_handlers.lock().unwrap().push(handler);
    }

    /// Builds and registers a matcher of the given post type against the
    /// shared registry, stamped with this engine's priority and key.
    pub fn on(&self, registry: &MatcherRegistry, r#type: TypeRule, rules: Vec<Rule>) -> Arc<Matcher> {
        let matcher = Arc::new(Matcher::new(r#type, rules, Some(self.service.clone())));
        matcher.set_priority(self.priority);
        matcher.set_block(self.default_block);
        registry.store(matcher.clone());
        matcher
    }

    pub fn on_message(&self, registry: &MatcherRegistry, rules: Vec<Rule>) -> Arc<Matcher> {
        self.on(registry, TypeRule::Message, rules)
    }

    pub fn on_notice(&self, registry: &MatcherRegistry, rules: Vec<Rule>) -> Arc<Matcher> {
        self.on(registry, TypeRule::Notice, rules)
    }

    pub fn on_request(&self, registry: &MatcherRegistry, rules: Vec<Rule>) -> Arc<Matcher> {
        self.on(registry, TypeRule::Request, rules)
    }

    pub fn on_command(&self, registry: &MatcherRegistry, name: impl Into<String>, extra: Vec<Rule>) -> Arc<Matcher> {
        let mut rules = vec![crate::rule::command(self.command_prefix.clone(), name)];
        rules.extend(extra);
        self.on_message(registry, rules)
    }

    pub fn on_prefix(&self, registry: &MatcherRegistry, prefix: impl Into<String>, extra: Vec<Rule>) -> Arc<Matcher> {
        let mut rules = vec![crate::rule::prefix(prefix)];
        rules.extend(extra);
        self.on_message(registry, rules)
    }

    pub fn on_suffix(&self, registry: &MatcherRegistry, suffix: impl Into<String>, extra: Vec<Rule>) -> Arc<Matcher> {
        let mut rules = vec![crate::rule::suffix(suffix)];
        rules.extend(extra);
        self.on_message(registry, rules)
    }

    pub fn on_keyword(&self, registry: &MatcherRegistry, words: Vec<String>, extra: Vec<Rule>) -> Arc<Matcher> {
        let mut rules = vec![crate::rule::keyword(words)];
        rules.extend(extra);
        self.on_message(registry, rules)
    }

    pub fn on_full_match(&self, registry: &MatcherRegistry, options: Vec<String>, extra: Vec<Rule>) -> Arc<Matcher> {
        let mut rules = vec![crate::rule::full_match(options)];
        rules.extend(extra);
        self.on_message(registry, rules)
    }

    pub fn on_regex(&self, registry: &MatcherRegistry, pattern: &str, extra: Vec<Rule>) -> Result<Arc<Matcher>, regex::Error> {
        let mut rules = vec![crate::rule::regex(pattern)?];
        rules.extend(extra);
        Ok(self.on_message(registry, rules))
    }

    /// Removes every live matcher bound to this service. Deliberately
    /// does not touch this service's control-layer DB rows — see
    /// `DESIGN.md`'s "Delete(service) retains DB rows" decision.
    pub fn delete(&self, registry: &MatcherRegistry) {
        registry.delete_by_engine(&self.service);
    }
}

/// Owns the priority/brief/folder uniqueness maps and the monotonic
/// default-priority counter. Registering a misconfigured service is a
/// startup-fatal panic, matching the original's own `panic()` calls.
pub struct Registrar {
    engines: Mutex<HashMap<String, Arc<Engine>>>,
    prio_to_service: Mutex<HashMap<i64, String>>,
    brief_to_service: Mutex<HashMap<String, String>>,
    folder_to_service: Mutex<HashMap<PathBuf, String>>,
    custom_priority: Mutex<Option<HashMap<String, i64>>>,
    next_priority: AtomicI64,
}

impl Registrar {
    pub fn new() -> Self {
        Self {
            engines: Mutex::new(HashMap::new()),
            prio_to_service: Mutex::new(HashMap::new()),
            brief_to_service: Mutex::new(HashMap::new()),
            folder_to_service: Mutex::new(HashMap::new()),
            custom_priority: Mutex::new(None),
            next_priority: AtomicI64::new(10),
        }
    }

    /// Installs a custom service→priority map. May be called exactly
    /// once; a second call panics, matching `register.go::LoadCustomPriority`.
    pub fn load_custom_priority(&self, map: HashMap<String, i64>) {
        let mut slot = self.custom_priority.lock().unwrap();
        if slot.is_some() {
            panic!("double-defined custom priority map");
        }
        self.next_priority
            .store((map.len() as i64 + 1) * 10, Ordering::Relaxed);
        *slot = Some(map);
    }

    pub fn register(&self, service: impl Into<String>, options: ServiceOptions) -> Arc<Engine> {
        let service = service.into();

        let from_custom_map = self
            .custom_priority
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|m| m.get(&service).copied());

        let priority = match options.custom_priority.or(from_custom_map) {
            Some(p) => p,
            None => self.next_priority.fetch_add(10, Ordering::Relaxed),
        };

        {
            let mut prio_map = self.prio_to_service.lock().unwrap();
            if let Some(existing) = prio_map.get(&priority) {
                panic!("priority {priority} is used by both {existing:?} and {service:?}");
            }
            prio_map.insert(priority, service.clone());
        }

        if let Some(brief) = &options.brief {
            let mut brief_map = self.brief_to_service.lock().unwrap();
            if let Some(existing) = brief_map.get(brief) {
                panic!("brief {brief:?} of service {service:?} has already been claimed by {existing:?}");
            }
            brief_map.insert(brief.clone(), service.clone());
        }

        let data_folder = resolve_data_folder(&service, &options);
        {
            let mut folder_map = self.folder_to_service.lock().unwrap();
            let is_default = data_folder == default_folder();
            if !is_default {
                if let Some(existing) = folder_map.get(&data_folder) {
                    panic!(
                        "data folder {data_folder:?} of service {service:?} is already used by {existing:?}"
                    );
                }
            }
            folder_map.insert(data_folder.clone(), service.clone());
        }
        std::fs::create_dir_all(&data_folder)
            .unwrap_or_else(|e| panic!("failed to create data folder {data_folder:?}: {e}"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&data_folder, std::fs::Permissions::from_mode(0o755));
        }

        let engine = Arc::new(Engine {
            service: service.clone(),
            priority,
            data_folder,
            default_block: options.default_block,
            command_prefix: options.command_prefix.clone().unwrap_or_else(|| "/".to_string()),
            pre_handlers: Mutex::new(Vec::new()),
            mid_handlers: Mutex::new(Vec::new()),
            post_handlers: Mutex::new(Vec::new()),
        });

        self.engines.lock().unwrap().insert(service, engine.clone());
        engine
    }

    pub fn get(&self, service: &str) -> Option<Arc<Engine>> {
        self.engines.lock().unwrap().get(service).cloned()
    }

    /// Services in ascending priority order, for `control::for_each_by_prio`.
    pub fn services_by_priority(&self) -> Vec<String> {
        let engines = self.engines.lock().unwrap();
        let mut pairs: Vec<(i64, String)> = engines.values().map(|e| (e.priority, e.service.clone())).collect();
        pairs.sort_by_key(|(p, _)| *p);
        pairs.into_iter().map(|(_, s)| s).collect()
    }

    pub fn remove(&self, service: &str) {
        self.engines.lock().unwrap().remove(service);
    }
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}

fn default_folder() -> PathBuf {
    PathBuf::from("data/zbp/")
}

fn resolve_data_folder(service: &str, options: &ServiceOptions) -> PathBuf {
    if let Some(folder) = &options.public_data_folder {
        assert!(
            folder.chars().next().map(|c| c.is_uppercase()).unwrap_or(false),
            "public data folder for service {service:?} must start with an uppercase letter"
        );
        return PathBuf::from(format!("data/{folder}/"));
    }
    if let Some(folder) = &options.private_data_folder {
        assert!(
            folder.chars().next().map(|c| c.is_lowercase()).unwrap_or(false),
            "private data folder for service {service:?} must start with a lowercase letter"
        );
        return PathBuf::from(folder);
    }
    default_folder()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_folder(tag: &str) -> ServiceOptions {
        ServiceOptions {
            public_data_folder: Some(format!(
                "Test{tag}{}",
                std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap()
                    .as_nanos()
            )),
            ..Default::default()
        }
    }

    #[test]
    fn default_priorities_increment_by_ten() {
        let registrar = Registrar::new();
        let e1 = registrar.register("svc1", unique_folder("A"));
        let e2 = registrar.register("svc2", unique_folder("B"));
        assert_eq!(e2.priority - e1.priority, 10);
        let _ = std::fs::remove_dir_all(&e1.data_folder);
        let _ = std::fs::remove_dir_all(&e2.data_folder);
    }

    #[test]
    #[should_panic(expected = "is used by both")]
    fn duplicate_custom_priority_panics() {
        let registrar = Registrar::new();
        let opts1 = ServiceOptions {
            custom_priority: Some(100),
            ..unique_folder("C")
        };
        let opts2 = ServiceOptions {
            custom_priority: Some(100),
            ..unique_folder("D")
        };
        registrar.register("svc1", opts1);
        registrar.register("svc2", opts2);
    }
}
