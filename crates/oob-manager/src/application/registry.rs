//! BoardServiceRegistry: maps board types to vendor plugin instances.
//!
//! Plugins are registered as *factories* keyed by [`BoardType`].  The first
//! time a node is resolved, its board type's factory builds a plugin instance
//! for that node; the instance is cached so every later call for the node
//! reuses it.  Tests can pin a specific instance to a node with
//! [`BoardServiceRegistry::override_for_node`].
//!
//! A missing mapping is a configuration defect: [`BoardServiceRegistry::resolve`]
//! fails with `ManagementError::Configuration` and nothing here retries.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use oob_core::{BoardType, ManagementError, Node, NodeId};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::application::board_service::BoardService;

/// Builds the plugin instance serving one node.
pub type BoardServiceFactory =
    Arc<dyn Fn(&Arc<Node>) -> Result<Arc<dyn BoardService>, ManagementError> + Send + Sync>;

struct CachedService {
    board: BoardType,
    service: Arc<dyn BoardService>,
}

/// Board type → plugin factory, plus per-node instance cache.
#[derive(Default)]
pub struct BoardServiceRegistry {
    factories: RwLock<HashMap<BoardType, BoardServiceFactory>>,
    instances: Mutex<HashMap<NodeId, CachedService>>,
    overrides: Mutex<HashMap<NodeId, Arc<dyn BoardService>>>,
}

impl BoardServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `board`.
    ///
    /// Without `overwrite` an existing registration is kept and `false` is
    /// returned, so repeated registration is idempotent.  With `overwrite`
    /// the factory is replaced and every cached instance built by the old one
    /// is evicted.
    pub fn register(&self, board: BoardType, factory: BoardServiceFactory, overwrite: bool) -> bool {
        let mut factories = self.factories.write();
        if factories.contains_key(&board) && !overwrite {
            debug!(board = %board, "board service already registered, keeping existing");
            return false;
        }
        let replaced = factories.insert(board.clone(), factory).is_some();
        drop(factories);

        if replaced {
            self.instances.lock().retain(|_, cached| cached.board != board);
        }
        info!(board = %board, replaced, "registered board service");
        true
    }

    /// Returns the plugin serving `node`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagementError::Configuration`] when no factory is
    /// registered for the node's board type, or when the factory fails or
    /// panics.
    pub fn resolve(&self, node: &Arc<Node>) -> Result<Arc<dyn BoardService>, ManagementError> {
        if let Some(service) = self.overrides.lock().get(node.id()) {
            return Ok(Arc::clone(service));
        }
        if let Some(cached) = self.instances.lock().get(node.id()) {
            return Ok(Arc::clone(&cached.service));
        }

        let factory = self
            .factories
            .read()
            .get(node.board())
            .cloned()
            .ok_or_else(|| {
                ManagementError::Configuration(format!(
                    "no board service registered for board type {} (node {})",
                    node.board(),
                    node.id()
                ))
            })?;

        let service = match catch_unwind(AssertUnwindSafe(|| factory(node))) {
            Ok(Ok(service)) => service,
            Ok(Err(e)) => {
                warn!(node_id = %node.id(), board = %node.board(), error = %e, "board service factory failed");
                return Err(ManagementError::Configuration(format!(
                    "board service for {} could not be created: {e}",
                    node.board()
                )));
            }
            Err(_panic) => {
                warn!(node_id = %node.id(), board = %node.board(), "board service factory panicked");
                return Err(ManagementError::Configuration(format!(
                    "board service for {} panicked during construction",
                    node.board()
                )));
            }
        };

        // Another caller may have raced us; keep whichever instance landed first.
        let mut instances = self.instances.lock();
        let cached = instances.entry(node.id().clone()).or_insert_with(|| CachedService {
            board: node.board().clone(),
            service,
        });
        Ok(Arc::clone(&cached.service))
    }

    /// Pins `service` to `node_id`, bypassing the factories.
    pub fn override_for_node(&self, node_id: NodeId, service: Arc<dyn BoardService>) {
        self.overrides.lock().insert(node_id, service);
    }

    pub fn clear_override(&self, node_id: &NodeId) {
        self.overrides.lock().remove(node_id);
    }

    /// Drops the cached instance and any override for `node_id`.
    pub fn evict(&self, node_id: &NodeId) {
        self.instances.lock().remove(node_id);
        self.overrides.lock().remove(node_id);
    }

    pub fn is_registered(&self, board: &BoardType) -> bool {
        self.factories.read().contains_key(board)
    }

    pub fn registered_boards(&self) -> Vec<BoardType> {
        self.factories.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::board_service::BoardService;
    use async_trait::async_trait;
    use oob_core::domain::hardware::Operation;
    use oob_core::Credentials;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixed {
        board: BoardType,
    }

    #[async_trait]
    impl BoardService for Fixed {
        fn board_type(&self) -> &BoardType {
            &self.board
        }

        fn supported_operations(&self) -> &[Operation] {
            &[]
        }
    }

    fn factory(builds: Arc<AtomicU32>) -> BoardServiceFactory {
        Arc::new(move |node: &Arc<Node>| {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Fixed {
                board: node.board().clone(),
            }) as Arc<dyn BoardService>)
        })
    }

    fn node(id: &str, vendor: &str) -> Arc<Node> {
        Arc::new(Node::new(
            NodeId::from(id),
            "127.0.0.1:623".parse().unwrap(),
            Credentials::new("u", "p"),
            BoardType::new(vendor, "m1"),
        ))
    }

    #[test]
    fn test_resolve_unknown_board_is_configuration_error() {
        let registry = BoardServiceRegistry::new();
        let err = registry.resolve(&node("N1", "acme")).err().expect("must fail");
        assert!(matches!(err, ManagementError::Configuration(_)));
    }

    #[test]
    fn test_register_is_idempotent_without_overwrite() {
        // Arrange
        let registry = BoardServiceRegistry::new();
        let builds = Arc::new(AtomicU32::new(0));
        let board = BoardType::new("acme", "m1");

        // Act
        let first = registry.register(board.clone(), factory(Arc::clone(&builds)), false);
        let second = registry.register(board.clone(), factory(Arc::clone(&builds)), false);

        // Assert
        assert!(first);
        assert!(!second);
        assert_eq!(registry.registered_boards(), vec![board]);
    }

    #[test]
    fn test_resolve_caches_instance_per_node() {
        // Arrange
        let registry = BoardServiceRegistry::new();
        let builds = Arc::new(AtomicU32::new(0));
        registry.register(BoardType::new("acme", "m1"), factory(Arc::clone(&builds)), false);
        let n1 = node("N1", "acme");

        // Act
        let a = registry.resolve(&n1).expect("resolve");
        let b = registry.resolve(&n1).expect("resolve");
        registry.resolve(&node("N2", "acme")).expect("resolve");

        // Assert
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 2, "one build per node");
    }

    #[test]
    fn test_overwrite_replaces_factory_and_evicts_instances() {
        // Arrange
        let registry = BoardServiceRegistry::new();
        let old_builds = Arc::new(AtomicU32::new(0));
        let new_builds = Arc::new(AtomicU32::new(0));
        let board = BoardType::new("acme", "m1");
        registry.register(board.clone(), factory(Arc::clone(&old_builds)), false);
        let n1 = node("N1", "acme");
        let before = registry.resolve(&n1).expect("resolve");

        // Act
        assert!(registry.register(board, factory(Arc::clone(&new_builds)), true));
        let after = registry.resolve(&n1).expect("resolve");

        // Assert
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(new_builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_or_panicking_factory_is_configuration_error() {
        let registry = BoardServiceRegistry::new();
        registry.register(
            BoardType::new("broken", "m1"),
            Arc::new(|_node: &Arc<Node>| -> Result<Arc<dyn BoardService>, ManagementError> {
                Err(ManagementError::Configuration("missing firmware table".into()))
            }),
            false,
        );
        registry.register(
            BoardType::new("panics", "m1"),
            Arc::new(|_node: &Arc<Node>| -> Result<Arc<dyn BoardService>, ManagementError> {
                panic!("plugin constructor exploded")
            }),
            false,
        );

        assert!(matches!(
            registry.resolve(&node("N1", "broken")),
            Err(ManagementError::Configuration(_))
        ));
        assert!(matches!(
            registry.resolve(&node("N2", "panics")),
            Err(ManagementError::Configuration(_))
        ));
    }

    #[test]
    fn test_override_wins_until_evicted() {
        // Arrange
        let registry = BoardServiceRegistry::new();
        let n1 = node("N1", "unregistered");
        let pinned: Arc<dyn BoardService> = Arc::new(Fixed {
            board: n1.board().clone(),
        });

        // Act
        registry.override_for_node(n1.id().clone(), Arc::clone(&pinned));
        let resolved = registry.resolve(&n1).expect("override");
        registry.evict(n1.id());

        // Assert
        assert!(Arc::ptr_eq(&resolved, &pinned));
        assert!(registry.resolve(&n1).is_err());
    }
}
