//! The in-process hierarchically-addressed space.
//!
//! A [`PathSpace`] is a tree of nodes addressed by absolute slash-delimited
//! paths. Each node holds a FIFO of typed values ([`NodeData`]) and child
//! nodes. Producers insert, consumers read (peek), take (destructively pop),
//! or block-wait; every mutation notifies the local [`WaitMap`] and the
//! context's [`NotificationSink`], which is how the remote mount server
//! observes local writes.
//!
//! A subtree can be grafted with a [`SpaceLeaf`]: operations addressed at or
//! below the leaf's mount path are delegated with mount-relative paths.
//! The remote mount client uses this to expose a server's export inside the
//! local tree.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pathspace_types::{path as path_util, Error, Expected};

use crate::codec;
use crate::liveness::SpaceRegistry;
use crate::node::{NodeData, ValueRecord};
use crate::waitmap::WaitMap;
use crate::{type_name_of, PathValue};

/// Sentinel timeout treated as "wait forever".
pub const DEFAULT_TIMEOUT: Duration = Duration::MAX;

/// Depth limit meaning "no limit".
pub const UNLIMITED_DEPTH: usize = usize::MAX;

/// Default cap on children enumerated per node during visitation.
pub const DEFAULT_MAX_CHILDREN: usize = 64;

/// Observer of local path mutations.
///
/// Implementations must chain to an optional downstream sink so that
/// interposition (the mount server swapping itself in front of an existing
/// sink) composes.
pub trait NotificationSink: Send + Sync {
    /// Called after the value queue at `path` changed.
    fn notify(&self, path: &str);
}

/// Shared context of a space, owning the settable notification sink.
#[derive(Default)]
pub struct SpaceContext {
    sink: Mutex<Option<Arc<dyn NotificationSink>>>,
}

impl SpaceContext {
    /// Current sink, if any.
    pub fn sink(&self) -> Option<Arc<dyn NotificationSink>> {
        lock_ignore_poison(&self.sink).clone()
    }

    /// Replace the sink. Passing `None` removes it.
    pub fn set_sink(&self, sink: Option<Arc<dyn NotificationSink>>) {
        *lock_ignore_poison(&self.sink) = sink;
    }

    fn notify(&self, path: &str) {
        if let Some(sink) = self.sink() {
            sink.notify(path);
        }
    }
}

/// Outcome of an insert.
#[derive(Clone, Debug, Default)]
pub struct InsertReturn {
    /// Plain values appended to node queues.
    pub values_inserted: u32,
    /// Nested spaces / leaves grafted.
    pub spaces_inserted: u32,
    /// Execution payloads accepted.
    pub tasks_inserted: u32,
    /// Errors encountered; empty means success.
    pub errors: Vec<Error>,
}

impl InsertReturn {
    /// A single-value success.
    pub fn value() -> Self {
        Self {
            values_inserted: 1,
            ..Self::default()
        }
    }

    /// A failed insert carrying one error.
    pub fn from_error(error: Error) -> Self {
        Self {
            errors: vec![error],
            ..Self::default()
        }
    }

    /// True when no errors were recorded.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// How a read-side operation should behave.
#[derive(Clone, Debug, Default)]
pub struct OutOptions {
    /// Destructively pop the front value instead of peeking it.
    pub pop: bool,
    /// Park up to this long when the node is empty. [`DEFAULT_TIMEOUT`]
    /// means wait forever.
    pub block: Option<Duration>,
}

impl OutOptions {
    /// Non-destructive, non-blocking read.
    pub fn read() -> Self {
        Self::default()
    }

    /// Destructive, non-blocking pop.
    pub fn take() -> Self {
        Self {
            pop: true,
            block: None,
        }
    }

    /// Destructive pop that parks up to `timeout`.
    pub fn take_blocking(timeout: Duration) -> Self {
        Self {
            pop: true,
            block: Some(timeout),
        }
    }

    /// Non-destructive read that parks up to `timeout`.
    pub fn wait(timeout: Duration) -> Self {
        Self {
            pop: false,
            block: Some(timeout),
        }
    }
}

/// Value shapes a leaf can accept on insert.
#[derive(Clone, Debug)]
pub enum InsertPayload {
    /// A codec-framed typed value.
    Typed {
        /// Registry name of the value's type.
        type_name: String,
        /// Header-framed codec bytes.
        bytes: Vec<u8>,
    },
    /// An execution sentinel with no value bytes.
    Void {
        /// Registry name of the task's result type.
        type_name: String,
    },
}

/// A grafted subtree implementation (e.g. a remote mount).
pub trait SpaceLeaf: Send + Sync {
    /// Insert a value at a mount-relative path.
    fn insert(&self, relative: &str, payload: InsertPayload) -> InsertReturn;

    /// Read, take, or block-wait at a mount-relative path.
    fn out(
        &self,
        relative: &str,
        expected_type: &str,
        options: &OutOptions,
    ) -> Expected<ValueRecord>;

    /// Detach the leaf from its backing implementation.
    fn shutdown(&self);
}

/// Options controlling [`PathSpace::visit`].
#[derive(Clone, Debug)]
pub struct VisitOptions {
    /// Absolute path of the subtree root to visit.
    pub root: String,
    /// Maximum depth below the root (the root itself is depth 0; a limit of
    /// 1 visits only the root node).
    pub max_depth: usize,
    /// Attach value snapshots to visited entries.
    pub include_values: bool,
    /// Cap on children enumerated per node.
    pub max_children: usize,
}

impl Default for VisitOptions {
    fn default() -> Self {
        Self {
            root: "/".to_string(),
            max_depth: UNLIMITED_DEPTH,
            include_values: false,
            max_children: DEFAULT_MAX_CHILDREN,
        }
    }
}

/// One visited node.
#[derive(Clone, Debug)]
pub struct VisitEntry {
    /// Canonical absolute path of the node.
    pub path: String,
    /// Snapshot of the node's value queue when requested and non-empty.
    pub snapshot: Option<NodeData>,
}

/// Visitor verdict after each entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisitControl {
    /// Keep walking.
    Continue,
    /// Stop the visitation.
    Stop,
}

#[derive(Default)]
struct Node {
    data: NodeData,
    children: BTreeMap<String, Node>,
    leaf: Option<Arc<dyn SpaceLeaf>>,
}

/// The in-process space.
pub struct PathSpace {
    root: Mutex<Node>,
    context: Arc<SpaceContext>,
    wait_map: WaitMap,
}

impl PathSpace {
    /// Create a space and register it with the liveness registry.
    pub fn new() -> Arc<Self> {
        let space = Arc::new(Self {
            root: Mutex::new(Node::default()),
            context: Arc::new(SpaceContext::default()),
            wait_map: WaitMap::new(),
        });
        SpaceRegistry::instance().register(&space);
        space
    }

    /// Shared context carrying the notification sink.
    pub fn shared_context(&self) -> Arc<SpaceContext> {
        Arc::clone(&self.context)
    }

    /// Notify local waiters and the installed sink about a mutation.
    pub fn notify(&self, path: &str) {
        self.wait_map.notify(path);
        self.context.notify(path);
    }

    // -----------------------------------------------------------------
    // Typed surface
    // -----------------------------------------------------------------

    /// Append a value to the queue at `path`.
    pub fn insert<T: PathValue>(&self, path: &str, value: &T) -> InsertReturn {
        match codec::serialize_value(value) {
            Ok(bytes) => self.insert_serialized(
                path,
                ValueRecord {
                    type_name: type_name_of::<T>().to_string(),
                    bytes,
                },
            ),
            Err(error) => InsertReturn::from_error(error),
        }
    }

    /// Peek the front value at `path`.
    pub fn read<T: PathValue>(&self, path: &str) -> Expected<T> {
        self.out(path, &OutOptions::read())
    }

    /// Pop the front value at `path`.
    pub fn take<T: PathValue>(&self, path: &str, options: &OutOptions) -> Expected<T> {
        let mut options = options.clone();
        options.pop = true;
        self.out(path, &options)
    }

    /// Read, take, or block-wait with explicit options.
    pub fn out<T: PathValue>(&self, path: &str, options: &OutOptions) -> Expected<T> {
        let record = self.out_serialized(path, type_name_of::<T>(), options)?;
        if record.type_name != type_name_of::<T>() {
            return Err(Error::InvalidType(format!(
                "stored type {} does not match requested {}",
                record.type_name,
                type_name_of::<T>()
            )));
        }
        codec::deserialize_value(&record.bytes)
    }

    /// Replace the queue at `path` with a single value (metric semantics).
    pub fn replace<T: PathValue>(&self, path: &str, value: &T) -> InsertReturn {
        match codec::serialize_value(value) {
            Ok(bytes) => self.replace_serialized(
                path,
                ValueRecord {
                    type_name: type_name_of::<T>().to_string(),
                    bytes,
                },
            ),
            Err(error) => InsertReturn::from_error(error),
        }
    }

    // -----------------------------------------------------------------
    // Serialized surface
    // -----------------------------------------------------------------

    /// Append an already-encoded record to the queue at `path`.
    pub fn insert_serialized(&self, path: &str, record: ValueRecord) -> InsertReturn {
        let canonical = match path_util::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(error) => return InsertReturn::from_error(error),
        };
        if let Some((leaf, relative)) = self.resolve_leaf(&canonical) {
            return leaf.insert(
                &relative,
                InsertPayload::Typed {
                    type_name: record.type_name,
                    bytes: record.bytes,
                },
            );
        }
        {
            let mut root = lock_ignore_poison(&self.root);
            let node = ensure_node(&mut root, &canonical);
            node.data.push_record(record);
        }
        self.notify(&canonical);
        InsertReturn::value()
    }

    /// Replace the queue at `path` with a single encoded record.
    pub fn replace_serialized(&self, path: &str, record: ValueRecord) -> InsertReturn {
        let canonical = match path_util::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(error) => return InsertReturn::from_error(error),
        };
        if let Some((leaf, relative)) = self.resolve_leaf(&canonical) {
            return leaf.insert(
                &relative,
                InsertPayload::Typed {
                    type_name: record.type_name,
                    bytes: record.bytes,
                },
            );
        }
        {
            let mut root = lock_ignore_poison(&self.root);
            let node = ensure_node(&mut root, &canonical);
            node.data = NodeData::new();
            node.data.push_record(record);
        }
        self.notify(&canonical);
        InsertReturn::value()
    }

    /// Peek the front record at `path` without type checking.
    pub fn read_serialized(&self, path: &str) -> Expected<ValueRecord> {
        let canonical = path_util::canonicalize(path)?;
        if let Some((leaf, relative)) = self.resolve_leaf(&canonical) {
            return leaf.out(&relative, "", &OutOptions::read());
        }
        let root = lock_ignore_poison(&self.root);
        let node = find_node(&root, &canonical)
            .ok_or_else(|| Error::NoSuchPath(format!("no node at {canonical}")))?;
        node.data.front_record()
    }

    /// Names of the children of `path`, sorted lexicographically.
    pub fn list_children(&self, path: &str) -> Vec<String> {
        let Ok(canonical) = path_util::canonicalize(path) else {
            return Vec::new();
        };
        let root = lock_ignore_poison(&self.root);
        match find_node(&root, &canonical) {
            Some(node) => node.children.keys().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Walk the subtree under `options.root` breadth-first.
    ///
    /// Entries are collected under the space lock and handed to the visitor
    /// afterwards, so the visitor may freely call back into the space.
    pub fn visit(
        &self,
        options: &VisitOptions,
        mut visitor: impl FnMut(&VisitEntry) -> VisitControl,
    ) -> Expected<()> {
        let canonical = path_util::canonicalize(&options.root)?;
        if self.resolve_leaf(&canonical).is_some() {
            return Err(Error::NotSupported(
                "mounted subtrees do not support visit".into(),
            ));
        }
        let entries = {
            let root = lock_ignore_poison(&self.root);
            let start = find_node(&root, &canonical)
                .ok_or_else(|| Error::NoSuchPath(format!("no node at {canonical}")))?;
            collect_entries(start, &canonical, options)
        };
        for entry in &entries {
            if visitor(entry) == VisitControl::Stop {
                break;
            }
        }
        Ok(())
    }

    /// Graft a leaf implementation at `path`.
    pub fn insert_leaf(&self, path: &str, leaf: Arc<dyn SpaceLeaf>) -> InsertReturn {
        let canonical = match path_util::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(error) => return InsertReturn::from_error(error),
        };
        if canonical == "/" {
            return InsertReturn::from_error(Error::InvalidPath(
                "cannot mount a leaf at the root".into(),
            ));
        }
        {
            let mut root = lock_ignore_poison(&self.root);
            let node = ensure_node(&mut root, &canonical);
            if node.leaf.is_some() {
                return InsertReturn::from_error(Error::InvalidPermissions(format!(
                    "a leaf is already mounted at {canonical}"
                )));
            }
            node.leaf = Some(leaf);
        }
        self.notify(&canonical);
        InsertReturn {
            spaces_inserted: 1,
            ..InsertReturn::default()
        }
    }

    fn out_serialized(
        &self,
        path: &str,
        expected_type: &str,
        options: &OutOptions,
    ) -> Expected<ValueRecord> {
        let canonical = path_util::canonicalize(path)?;
        if let Some((leaf, relative)) = self.resolve_leaf(&canonical) {
            return leaf.out(&relative, expected_type, options);
        }
        let Some(timeout) = options.block else {
            let record = self.try_out_once(&canonical, options.pop)?;
            if options.pop {
                self.notify(&canonical);
            }
            return Ok(record);
        };
        // `None` deadline means wait forever, parking in long slices.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            // The wait guard is taken before the emptiness check so a
            // concurrent insert cannot notify between check and park. It is
            // released before notifying: notify re-enters the wait map.
            let mut wait_guard = self.wait_map.wait(&canonical);
            match self.try_out_once(&canonical, options.pop) {
                Ok(record) => {
                    drop(wait_guard);
                    if options.pop {
                        self.notify(&canonical);
                    }
                    return Ok(record);
                }
                Err(Error::NoSuchPath(_) | Error::NoObjectFound(_)) => match deadline {
                    None => {
                        let slice = Instant::now() + Duration::from_secs(3600);
                        let _ = wait_guard.wait_until(slice);
                    }
                    Some(instant) => {
                        if Instant::now() >= instant {
                            return Err(Error::Timeout(format!(
                                "timed out waiting for {canonical}"
                            )));
                        }
                        let _ = wait_guard.wait_until(instant);
                    }
                },
                Err(error) => return Err(error),
            }
        }
    }

    /// One locked attempt; never notifies.
    fn try_out_once(&self, canonical: &str, pop: bool) -> Expected<ValueRecord> {
        let mut root = lock_ignore_poison(&self.root);
        match find_node_mut(&mut root, canonical) {
            None => Err(Error::NoSuchPath(format!("no node at {canonical}"))),
            Some(node) if node.data.is_empty() => {
                Err(Error::NoObjectFound(format!("no values at {canonical}")))
            }
            Some(node) => {
                if pop {
                    node.data.pop_front_record()
                } else {
                    node.data.front_record()
                }
            }
        }
    }

    fn resolve_leaf(&self, canonical: &str) -> Option<(Arc<dyn SpaceLeaf>, String)> {
        let root = lock_ignore_poison(&self.root);
        let segments: Vec<&str> = canonical.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = &*root;
        for (index, segment) in segments.iter().enumerate() {
            let child = current.children.get(*segment)?;
            if let Some(leaf) = &child.leaf {
                let relative = if index + 1 >= segments.len() {
                    "/".to_string()
                } else {
                    format!("/{}", segments[index + 1..].join("/"))
                };
                return Some((Arc::clone(leaf), relative));
            }
            current = child;
        }
        None
    }
}

impl Drop for PathSpace {
    fn drop(&mut self) {
        // Unregister before any teardown so safe_notify callers cannot
        // reach a space mid-destruction.
        SpaceRegistry::instance().unregister_key(self as *const Self as usize);
        self.wait_map.notify_all();
    }
}

fn ensure_node<'a>(root: &'a mut Node, canonical: &str) -> &'a mut Node {
    let mut current = root;
    for segment in canonical.split('/').filter(|s| !s.is_empty()) {
        current = current.children.entry(segment.to_string()).or_default();
    }
    current
}

fn find_node<'a>(root: &'a Node, canonical: &str) -> Option<&'a Node> {
    let mut current = root;
    for segment in canonical.split('/').filter(|s| !s.is_empty()) {
        current = current.children.get(segment)?;
    }
    Some(current)
}

fn find_node_mut<'a>(root: &'a mut Node, canonical: &str) -> Option<&'a mut Node> {
    let mut current = root;
    for segment in canonical.split('/').filter(|s| !s.is_empty()) {
        current = current.children.get_mut(segment)?;
    }
    Some(current)
}

fn collect_entries(start: &Node, root_path: &str, options: &VisitOptions) -> Vec<VisitEntry> {
    let mut entries = Vec::new();
    let mut queue: Vec<(&Node, String, usize)> = vec![(start, root_path.to_string(), 0)];
    let mut cursor = 0;
    while cursor < queue.len() {
        let (node, path, depth) = (queue[cursor].0, queue[cursor].1.clone(), queue[cursor].2);
        cursor += 1;
        let snapshot = if options.include_values && !node.data.is_empty() {
            Some(node.data.clone())
        } else {
            None
        };
        entries.push(VisitEntry {
            path: path.clone(),
            snapshot,
        });
        if depth + 1 < options.max_depth || options.max_depth == UNLIMITED_DEPTH {
            for (name, child) in node.children.iter().take(options.max_children) {
                if child.leaf.is_some() {
                    continue;
                }
                queue.push((child, path_util::join(&path, name), depth + 1));
            }
        }
    }
    entries
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_insert_read_take_roundtrip() {
        let space = PathSpace::new();
        assert!(space.insert("/data/x", &"hello".to_string()).is_ok());
        let read: String = space.read("/data/x").expect("read");
        assert_eq!(read, "hello");
        // Read does not consume.
        let taken: String = space.take("/data/x", &OutOptions::take()).expect("take");
        assert_eq!(taken, "hello");
        let empty: Expected<String> = space.read("/data/x");
        assert!(matches!(empty, Err(Error::NoObjectFound(_))));
    }

    #[test]
    fn test_take_preserves_fifo_order() {
        let space = PathSpace::new();
        for value in [1u32, 2, 3] {
            space.insert("/queue", &value);
        }
        for expected in [1u32, 2, 3] {
            let taken: u32 = space.take("/queue", &OutOptions::take()).expect("take");
            assert_eq!(taken, expected);
        }
    }

    #[test]
    fn test_missing_node_is_no_such_path() {
        let space = PathSpace::new();
        let result: Expected<u32> = space.read("/missing");
        assert!(matches!(result, Err(Error::NoSuchPath(_))));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let space = PathSpace::new();
        space.insert("/data/x", &1u64);
        let result: Expected<String> = space.read("/data/x");
        assert!(matches!(result, Err(Error::InvalidType(_))));
    }

    #[test]
    fn test_blocking_take_wakes_on_insert() {
        let space = PathSpace::new();
        let consumer = {
            let space = Arc::clone(&space);
            std::thread::spawn(move || {
                space.take::<u32>("/feed", &OutOptions::take_blocking(Duration::from_secs(5)))
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        space.insert("/feed", &99u32);
        let taken = consumer.join().expect("consumer thread").expect("take");
        assert_eq!(taken, 99);
    }

    #[test]
    fn test_blocking_take_times_out() {
        let space = PathSpace::new();
        let result: Expected<u32> =
            space.take("/never", &OutOptions::take_blocking(Duration::from_millis(40)));
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_sink_sees_mutations() {
        struct Counting {
            hits: AtomicUsize,
        }
        impl NotificationSink for Counting {
            fn notify(&self, _path: &str) {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
        }
        let space = PathSpace::new();
        let sink = Arc::new(Counting {
            hits: AtomicUsize::new(0),
        });
        space.shared_context().set_sink(Some(sink.clone()));
        space.insert("/data/x", &1u32);
        let _: u32 = space.take("/data/x", &OutOptions::take()).expect("take");
        assert_eq!(sink.hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_replace_keeps_single_value() {
        let space = PathSpace::new();
        space.replace("/metric", &1i64);
        space.replace("/metric", &2i64);
        let value: i64 = space.take("/metric", &OutOptions::take()).expect("take");
        assert_eq!(value, 2);
        let empty: Expected<i64> = space.read("/metric");
        assert!(empty.is_err());
    }

    #[test]
    fn test_list_children_sorted() {
        let space = PathSpace::new();
        space.insert("/dir/b", &1u32);
        space.insert("/dir/a", &1u32);
        space.insert("/dir/c/nested", &1u32);
        assert_eq!(space.list_children("/dir"), vec!["a", "b", "c"]);
        assert!(space.list_children("/absent").is_empty());
    }

    #[test]
    fn test_visit_depth_one_sees_only_root() {
        let space = PathSpace::new();
        space.insert("/tree", &1u32);
        space.insert("/tree/child", &2u32);
        let mut seen = Vec::new();
        space
            .visit(
                &VisitOptions {
                    root: "/tree".into(),
                    max_depth: 1,
                    include_values: true,
                    ..VisitOptions::default()
                },
                |entry| {
                    seen.push(entry.path.clone());
                    VisitControl::Continue
                },
            )
            .expect("visit");
        assert_eq!(seen, vec!["/tree"]);
    }

    #[test]
    fn test_visit_missing_root_fails() {
        let space = PathSpace::new();
        let result = space.visit(
            &VisitOptions {
                root: "/ghost".into(),
                ..VisitOptions::default()
            },
            |_| VisitControl::Continue,
        );
        assert!(matches!(result, Err(Error::NoSuchPath(_))));
    }

    struct EchoLeaf {
        hits: AtomicUsize,
    }

    impl SpaceLeaf for EchoLeaf {
        fn insert(&self, relative: &str, _payload: InsertPayload) -> InsertReturn {
            self.hits.fetch_add(1, Ordering::SeqCst);
            assert!(relative.starts_with('/'));
            InsertReturn::value()
        }

        fn out(
            &self,
            relative: &str,
            _expected_type: &str,
            _options: &OutOptions,
        ) -> Expected<ValueRecord> {
            Ok(ValueRecord {
                type_name: type_name_of::<String>().to_string(),
                bytes: codec::serialize_value(&relative.to_string()).expect("serialize"),
            })
        }

        fn shutdown(&self) {}
    }

    #[test]
    fn test_leaf_receives_relative_paths() {
        let space = PathSpace::new();
        let leaf = Arc::new(EchoLeaf {
            hits: AtomicUsize::new(0),
        });
        let grafted = space.insert_leaf("/remote/demo", leaf.clone());
        assert_eq!(grafted.spaces_inserted, 1);

        space.insert("/remote/demo/a/b", &1u32);
        assert_eq!(leaf.hits.load(Ordering::SeqCst), 1);

        let echoed: String = space.read("/remote/demo/x").expect("read");
        assert_eq!(echoed, "/x");
        let at_mount: String = space.read("/remote/demo").expect("read");
        assert_eq!(at_mount, "/");
    }

    #[test]
    fn test_double_mount_rejected() {
        let space = PathSpace::new();
        let leaf = Arc::new(EchoLeaf {
            hits: AtomicUsize::new(0),
        });
        assert!(space.insert_leaf("/remote/demo", leaf.clone()).is_ok());
        let second = space.insert_leaf("/remote/demo", leaf);
        assert!(matches!(
            second.errors.first(),
            Some(Error::InvalidPermissions(_))
        ));
    }

    #[test]
    fn test_visit_into_mounted_subtree_not_supported() {
        let space = PathSpace::new();
        let leaf = Arc::new(EchoLeaf {
            hits: AtomicUsize::new(0),
        });
        space.insert_leaf("/remote/demo", leaf);
        let result = space.visit(
            &VisitOptions {
                root: "/remote/demo/sub".into(),
                ..VisitOptions::default()
            },
            |_| VisitControl::Continue,
        );
        assert!(matches!(result, Err(Error::NotSupported(_))));
    }
}
