use salvage_core::TaskError;
use std::collections::HashMap;
use std::sync::Arc;

pub type TaskHandler =
    Arc<dyn Fn(serde_json::Value) -> Result<serde_json::Value, TaskError> + Send + Sync>;

/// Task handlers keyed by type. Only explicitly registered types are
/// advertised to the coordinator at registration.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, TaskHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: &str, handler: TaskHandler) {
        self.handlers.insert(task_type.to_string(), handler);
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn get(&self, task_type: &str) -> Option<&TaskHandler> {
        self.handlers.get(task_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registers_and_looks_up_handlers() {
        let mut registry = HandlerRegistry::new();
        let handler: TaskHandler = Arc::new(|_| Ok(json!({"ok": true})));
        registry.register("echo", Arc::clone(&handler));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn task_types_are_sorted_and_complete() {
        let mut registry = HandlerRegistry::new();
        registry.register("transcode", Arc::new(|_| Ok(json!({}))));
        registry.register("echo", Arc::new(|_| Ok(json!({}))));

        assert_eq!(
            registry.task_types(),
            vec!["echo".to_string(), "transcode".to_string()]
        );
    }

    #[test]
    fn re_registering_a_type_replaces_the_handler() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(|_| Ok(json!({"version": 1}))));
        registry.register("echo", Arc::new(|_| Ok(json!({"version": 2}))));

        let handler = registry.get("echo").expect("handler");
        let output = handler(json!({})).expect("invoke");
        assert_eq!(output["version"], json!(2));
    }
}
