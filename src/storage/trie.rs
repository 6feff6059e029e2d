// Trie - Persistent Merkle treap with content-addressed nodes
//
// Every node commits to its key, its value and both child subtrees, so the
// root hash authenticates the whole map. A node's priority is the hash of its
// key, which makes the tree shape (and therefore the root) a function of the
// content alone. Forks share every untouched subtree, `commit` writes only the
// nodes created since the last commit, and reopened views load nodes on demand.
use super::kv::{SharedStorage, StorageError, WriteOp};
use crate::types::Hash;
use serde::{de::DeserializeOwned, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

const NODE_PREFIX: &[u8] = b"trie:";
const NODE_DOMAIN: &[u8] = b"keel-trie-node";

/// On-disk node: key, value, then (hash, size) of the left and right subtrees
type StoredNode = (Vec<u8>, Vec<u8>, (Hash, u64), (Hash, u64));

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    priority: Hash,
    left: Link,
    right: Link,
    size: u64,
    hash: Hash,
    stored: AtomicBool,
}

impl Node {
    fn new(key: Vec<u8>, value: Vec<u8>, priority: Hash, left: Link, right: Link) -> Self {
        let size = 1 + left.size + right.size;
        let hash = Hash::hash_parts(&[
            NODE_DOMAIN,
            &(key.len() as u64).to_le_bytes()[..],
            key.as_slice(),
            &(value.len() as u64).to_le_bytes()[..],
            value.as_slice(),
            left.hash.as_bytes().as_slice(),
            &left.size.to_le_bytes()[..],
            right.hash.as_bytes().as_slice(),
            &right.size.to_le_bytes()[..],
        ]);
        Self {
            key,
            value,
            priority,
            left,
            right,
            size,
            hash,
            stored: AtomicBool::new(false),
        }
    }

    fn with_children(&self, left: Link, right: Link) -> Link {
        Link::loaded(Node::new(
            self.key.clone(),
            self.value.clone(),
            self.priority,
            left,
            right,
        ))
    }

    fn with_value(&self, value: &[u8]) -> Link {
        Link::loaded(Node::new(
            self.key.clone(),
            value.to_vec(),
            self.priority,
            self.left.clone(),
            self.right.clone(),
        ))
    }

    /// Heap order: higher (priority, key) sits closer to the root
    fn outranked_by(&self, priority: &Hash, key: &[u8]) -> bool {
        (priority, key) > (&self.priority, self.key.as_slice())
    }

    fn encode(&self) -> Result<Vec<u8>, TrieError> {
        let stored = (
            &self.key,
            &self.value,
            (self.left.hash, self.left.size),
            (self.right.hash, self.right.size),
        );
        bincode::serialize(&stored).map_err(|e| TrieError::Codec(e.to_string()))
    }
}

/// Reference to a subtree; the node itself is loaded from storage on first use
#[derive(Clone)]
struct Link {
    hash: Hash,
    size: u64,
    node: OnceLock<Arc<Node>>,
}

impl Link {
    fn empty() -> Self {
        Self {
            hash: Hash::ZERO,
            size: 0,
            node: OnceLock::new(),
        }
    }

    fn loaded(node: Node) -> Self {
        Self {
            hash: node.hash,
            size: node.size,
            node: OnceLock::from(Arc::new(node)),
        }
    }

    fn stored(hash: Hash, size: u64) -> Self {
        Self {
            hash,
            size,
            node: OnceLock::new(),
        }
    }

    fn resolve(&self, storage: &SharedStorage) -> Result<Option<&Arc<Node>>, TrieError> {
        if self.size == 0 {
            return Ok(None);
        }
        if let Some(node) = self.node.get() {
            return Ok(Some(node));
        }
        let node = load_node(storage, &self.hash)?;
        Ok(Some(self.node.get_or_init(|| Arc::new(node))))
    }
}

fn load_node(storage: &SharedStorage, hash: &Hash) -> Result<Node, TrieError> {
    let bytes = match storage.get(&node_key(hash)) {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound) => return Err(TrieError::MissingNode(*hash)),
        Err(e) => return Err(e.into()),
    };
    let (key, value, left, right): StoredNode =
        bincode::deserialize(&bytes).map_err(|e| TrieError::Codec(e.to_string()))?;

    let priority = Hash::hash(&key);
    let node = Node::new(
        key,
        value,
        priority,
        Link::stored(left.0, left.1),
        Link::stored(right.0, right.1),
    );
    if node.hash != *hash {
        return Err(TrieError::Corrupted(*hash));
    }
    node.stored.store(true, AtomicOrdering::Release);
    Ok(node)
}

fn insert(
    storage: &SharedStorage,
    link: &Link,
    key: &[u8],
    value: &[u8],
    priority: &Hash,
) -> Result<Link, TrieError> {
    let Some(node) = link.resolve(storage)? else {
        return Ok(Link::loaded(Node::new(
            key.to_vec(),
            value.to_vec(),
            *priority,
            Link::empty(),
            Link::empty(),
        )));
    };

    match key.cmp(node.key.as_slice()) {
        Ordering::Equal if node.value == value => Ok(link.clone()),
        Ordering::Equal => Ok(node.with_value(value)),
        _ if node.outranked_by(priority, key) => {
            let (left, right) = split(storage, link, key)?;
            Ok(Link::loaded(Node::new(
                key.to_vec(),
                value.to_vec(),
                *priority,
                left,
                right,
            )))
        }
        Ordering::Less => {
            let left = insert(storage, &node.left, key, value, priority)?;
            Ok(node.with_children(left, node.right.clone()))
        }
        Ordering::Greater => {
            let right = insert(storage, &node.right, key, value, priority)?;
            Ok(node.with_children(node.left.clone(), right))
        }
    }
}

/// Splits a subtree into keys below and above `key`
fn split(storage: &SharedStorage, link: &Link, key: &[u8]) -> Result<(Link, Link), TrieError> {
    let Some(node) = link.resolve(storage)? else {
        return Ok((Link::empty(), Link::empty()));
    };

    match node.key.as_slice().cmp(key) {
        Ordering::Less => {
            let (below, above) = split(storage, &node.right, key)?;
            Ok((node.with_children(node.left.clone(), below), above))
        }
        Ordering::Greater => {
            let (below, above) = split(storage, &node.left, key)?;
            Ok((below, node.with_children(above, node.right.clone())))
        }
        Ordering::Equal => Ok((node.left.clone(), node.right.clone())),
    }
}

/// `None` when the key is absent
fn remove(storage: &SharedStorage, link: &Link, key: &[u8]) -> Result<Option<Link>, TrieError> {
    let Some(node) = link.resolve(storage)? else {
        return Ok(None);
    };

    match key.cmp(node.key.as_slice()) {
        Ordering::Equal => merge(storage, &node.left, &node.right).map(Some),
        Ordering::Less => Ok(remove(storage, &node.left, key)?
            .map(|left| node.with_children(left, node.right.clone()))),
        Ordering::Greater => Ok(remove(storage, &node.right, key)?
            .map(|right| node.with_children(node.left.clone(), right))),
    }
}

/// Joins two subtrees where every key on the left sorts before the right
fn merge(storage: &SharedStorage, left: &Link, right: &Link) -> Result<Link, TrieError> {
    let (l, r) = match (left.resolve(storage)?, right.resolve(storage)?) {
        (None, _) => return Ok(right.clone()),
        (_, None) => return Ok(left.clone()),
        (Some(l), Some(r)) => (l, r),
    };

    if r.outranked_by(&l.priority, &l.key) {
        let merged = merge(storage, &l.right, right)?;
        Ok(l.with_children(l.left.clone(), merged))
    } else {
        let merged = merge(storage, left, &r.left)?;
        Ok(r.with_children(merged, r.right.clone()))
    }
}

// Post-order, so children precede parents in the write batch
fn collect_unstored<'a>(link: &'a Link, out: &mut Vec<&'a Arc<Node>>) {
    if let Some(node) = link.node.get() {
        if !node.stored.load(AtomicOrdering::Acquire) {
            collect_unstored(&node.left, out);
            collect_unstored(&node.right, out);
            out.push(node);
        }
    }
}

fn node_key(hash: &Hash) -> Vec<u8> {
    let mut key = NODE_PREFIX.to_vec();
    key.extend_from_slice(hash.as_bytes());
    key
}

#[derive(Clone)]
pub struct Trie {
    storage: SharedStorage,
    root: Link,
}

impl Trie {
    /// Empty trie
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            root: Link::empty(),
        }
    }

    /// Reopens a committed view; `Hash::ZERO` is the empty trie
    pub fn from_root(storage: SharedStorage, root: Hash) -> Result<Self, TrieError> {
        if root.is_zero() {
            return Ok(Self::new(storage));
        }

        let node = match load_node(&storage, &root) {
            Ok(node) => node,
            Err(TrieError::MissingNode(hash)) => return Err(TrieError::RootNotFound(hash)),
            Err(e) => return Err(e),
        };
        Ok(Self {
            storage,
            root: Link::loaded(node),
        })
    }

    pub fn get(&self, key: &[u8]) -> Result<&[u8], TrieError> {
        let mut link = &self.root;
        while let Some(node) = link.resolve(&self.storage)? {
            match key.cmp(node.key.as_slice()) {
                Ordering::Equal => return Ok(&node.value),
                Ordering::Less => link = &node.left,
                Ordering::Greater => link = &node.right,
            }
        }
        Err(TrieError::NotFound)
    }

    pub fn get_value<T: DeserializeOwned>(&self, key: &[u8]) -> Result<T, TrieError> {
        let bytes = self.get(key)?;
        bincode::deserialize(bytes).map_err(|e| TrieError::Codec(e.to_string()))
    }

    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<(), TrieError> {
        let priority = Hash::hash(key);
        self.root = insert(&self.storage, &self.root, key, &value, &priority)?;
        Ok(())
    }

    pub fn put_value<T: Serialize>(&mut self, key: &[u8], value: &T) -> Result<(), TrieError> {
        let bytes = bincode::serialize(value).map_err(|e| TrieError::Codec(e.to_string()))?;
        self.put(key, bytes)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        match remove(&self.storage, &self.root, key)? {
            Some(root) => {
                self.root = root;
                Ok(())
            }
            None => Err(TrieError::NotFound),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, TrieError> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(TrieError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn len(&self) -> usize {
        self.root.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.root.size == 0
    }

    /// Entries in ascending key order
    pub fn iterate(&self) -> Iter<'_> {
        Iter::seek(self, &[])
    }

    /// Entries whose key starts with `prefix`, ascending
    pub fn iterate_prefix<'a>(
        &'a self,
        prefix: &'a [u8],
    ) -> impl Iterator<Item = Result<(&'a [u8], &'a [u8]), TrieError>> + 'a {
        Iter::seek(self, prefix).take_while(move |entry| match entry {
            Ok((key, _)) => key.starts_with(prefix),
            Err(_) => true,
        })
    }

    /// Merkle root, `Hash::ZERO` when empty
    pub fn root_hash(&self) -> Hash {
        self.root.hash
    }

    /// Persists nodes created since the last commit and returns the root
    pub fn commit(&self) -> Result<Hash, TrieError> {
        let mut fresh = Vec::new();
        collect_unstored(&self.root, &mut fresh);
        if fresh.is_empty() {
            return Ok(self.root.hash);
        }

        let ops = fresh
            .iter()
            .map(|node| {
                Ok(WriteOp::Put {
                    key: node_key(&node.hash),
                    value: node.encode()?,
                })
            })
            .collect::<Result<Vec<_>, TrieError>>()?;
        self.storage.write_batch(ops)?;

        for node in fresh {
            node.stored.store(true, AtomicOrdering::Release);
        }
        Ok(self.root.hash)
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }
}

impl fmt::Debug for Trie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trie")
            .field("entries", &self.root.size)
            .field("root", &self.root.hash)
            .finish()
    }
}

/// In-order walk; a storage failure is yielded once and ends the walk
pub struct Iter<'a> {
    storage: &'a SharedStorage,
    stack: Vec<&'a Arc<Node>>,
    failed: Option<TrieError>,
}

impl<'a> Iter<'a> {
    /// Positions the walk at the first key not below `from`
    fn seek(trie: &'a Trie, from: &[u8]) -> Self {
        let mut iter = Self {
            storage: &trie.storage,
            stack: Vec::new(),
            failed: None,
        };

        let mut link = &trie.root;
        loop {
            match link.resolve(&trie.storage) {
                Ok(Some(node)) if node.key.as_slice() >= from => {
                    iter.stack.push(node);
                    link = &node.left;
                }
                Ok(Some(node)) => link = &node.right,
                Ok(None) => break,
                Err(e) => {
                    iter.failed = Some(e);
                    break;
                }
            }
        }
        iter
    }

    fn push_left(&mut self, mut link: &'a Link) -> Result<(), TrieError> {
        while let Some(node) = link.resolve(self.storage)? {
            self.stack.push(node);
            link = &node.left;
        }
        Ok(())
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = Result<(&'a [u8], &'a [u8]), TrieError>;

    fn next(&mut self) -> Option<Self::Item> {
        let Some(node) = self.stack.pop() else {
            return self.failed.take().map(Err);
        };
        if let Err(e) = self.push_left(&node.right) {
            self.stack.clear();
            self.failed = Some(e);
        }
        Some(Ok((node.key.as_slice(), node.value.as_slice())))
    }
}

/// Trie errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrieError {
    #[error("Key not found")]
    NotFound,

    #[error("No committed trie for root {0}")]
    RootNotFound(Hash),

    #[error("Trie node {0} missing from storage")]
    MissingNode(Hash),

    #[error("Trie node {0} does not hash to its address")]
    Corrupted(Hash),

    #[error("Encoding error: {0}")]
    Codec(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv::{MemoryStorage, Storage};

    fn keys(trie: &Trie) -> Vec<Vec<u8>> {
        trie.iterate().map(|entry| entry.unwrap().0.to_vec()).collect()
    }

    #[test]
    fn test_get_put_delete() {
        let mut trie = Trie::new(MemoryStorage::shared());
        assert_eq!(trie.get(b"a"), Err(TrieError::NotFound));

        trie.put(b"a", b"1".to_vec()).unwrap();
        assert_eq!(trie.get(b"a").unwrap(), b"1");

        trie.delete(b"a").unwrap();
        assert_eq!(trie.delete(b"a"), Err(TrieError::NotFound));
        assert_eq!(trie.root_hash(), Hash::ZERO);
    }

    #[test]
    fn test_root_depends_on_content_not_insertion_order() {
        let storage = MemoryStorage::shared();
        let mut t1 = Trie::new(storage.clone());
        let mut t2 = Trie::new(storage);
        for i in 0u8..50 {
            t1.put(&[i], vec![i]).unwrap();
            t2.put(&[49 - i], vec![49 - i]).unwrap();
        }
        assert_eq!(t1.root_hash(), t2.root_hash());

        t2.put(&[7], vec![0]).unwrap();
        assert_ne!(t1.root_hash(), t2.root_hash());
    }

    #[test]
    fn test_delete_restores_previous_root() {
        let mut trie = Trie::new(MemoryStorage::shared());
        for key in [b"m", b"c", b"x", b"a"] {
            trie.put(key, key.to_vec()).unwrap();
        }
        let before = trie.root_hash();

        trie.put(b"q", vec![1]).unwrap();
        trie.delete(b"c").unwrap();
        trie.put(b"c", b"c".to_vec()).unwrap();
        trie.delete(b"q").unwrap();
        assert_eq!(trie.root_hash(), before);
        assert_eq!(trie.len(), 4);
    }

    #[test]
    fn test_iterate_prefix_is_ordered_and_bounded() {
        let mut trie = Trie::new(MemoryStorage::shared());
        trie.put(b"ab2", vec![2]).unwrap();
        trie.put(b"ab1", vec![1]).unwrap();
        trie.put(b"ac", vec![3]).unwrap();
        trie.put(b"a", vec![0]).unwrap();
        trie.put(b"aa", vec![4]).unwrap();

        let prefixed: Vec<&[u8]> = trie
            .iterate_prefix(b"ab")
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(prefixed, vec![b"ab1".as_slice(), b"ab2".as_slice()]);
        assert_eq!(
            keys(&trie),
            vec![b"a".to_vec(), b"aa".to_vec(), b"ab1".to_vec(), b"ab2".to_vec(), b"ac".to_vec()]
        );
    }

    #[test]
    fn test_fork_does_not_leak_into_parent() {
        let mut parent = Trie::new(MemoryStorage::shared());
        parent.put(b"k", b"v".to_vec()).unwrap();
        let root = parent.root_hash();

        let mut child = parent.clone();
        child.put(b"k2", b"v2".to_vec()).unwrap();
        child.put(b"k", b"w".to_vec()).unwrap();
        assert_eq!(parent.root_hash(), root);
        assert!(!parent.contains(b"k2").unwrap());
        assert_eq!(parent.get(b"k").unwrap(), b"v");
    }

    #[test]
    fn test_commit_and_reopen() {
        let storage = MemoryStorage::shared();
        let mut trie = Trie::new(storage.clone());
        trie.put_value(b"n", &42u64).unwrap();
        for i in 0u16..200 {
            trie.put(&i.to_be_bytes(), vec![1]).unwrap();
        }
        let root = trie.commit().unwrap();

        let reopened = Trie::from_root(storage.clone(), root).unwrap();
        assert_eq!(reopened.get_value::<u64>(b"n").unwrap(), 42);
        assert_eq!(reopened.root_hash(), root);
        assert_eq!(reopened.len(), 201);
        assert_eq!(keys(&reopened), keys(&trie));

        let missing = Hash::hash(b"nope");
        assert_eq!(
            Trie::from_root(storage, missing).unwrap_err(),
            TrieError::RootNotFound(missing)
        );
    }

    #[test]
    fn test_commit_writes_only_changed_nodes() {
        let backend = Arc::new(MemoryStorage::new());
        let storage: SharedStorage = backend.clone();
        let mut base = Trie::new(storage);
        for i in 0u32..2000 {
            base.put(&i.to_be_bytes(), i.to_le_bytes().to_vec()).unwrap();
        }
        let base_root = base.commit().unwrap();
        let written = backend.len();
        assert_eq!(written, 2000);

        let mut fork = base.clone();
        fork.put(&7u32.to_be_bytes(), vec![0xff]).unwrap();
        fork.put(&5000u32.to_be_bytes(), vec![1]).unwrap();
        fork.commit().unwrap();

        let added = backend.len() - written;
        assert!(added < 100, "second commit wrote {added} nodes");
        assert_eq!(base.root_hash(), base_root);
        assert_eq!(base.get(&7u32.to_be_bytes()).unwrap(), &7u32.to_le_bytes());

        let reopened = Trie::from_root(backend.clone(), fork.root_hash()).unwrap();
        assert_eq!(reopened.len(), 2001);
        assert_eq!(reopened.get(&7u32.to_be_bytes()).unwrap(), &[0xffu8]);
    }

    #[test]
    fn test_tampered_node_detected() {
        let storage = MemoryStorage::shared();
        let mut trie = Trie::new(storage.clone());
        trie.put(b"k", b"v".to_vec()).unwrap();
        let root = trie.commit().unwrap();

        let forged: StoredNode = (
            b"k".to_vec(),
            b"w".to_vec(),
            (Hash::ZERO, 0),
            (Hash::ZERO, 0),
        );
        storage
            .put(&node_key(&root), &bincode::serialize(&forged).unwrap())
            .unwrap();
        assert_eq!(
            Trie::from_root(storage, root).unwrap_err(),
            TrieError::Corrupted(root)
        );
    }

    #[test]
    fn test_missing_inner_node_surfaces_on_read() {
        let storage = MemoryStorage::shared();
        let mut trie = Trie::new(storage.clone());
        for i in 0u8..64 {
            trie.put(&[i], vec![i]).unwrap();
        }
        let root = trie.commit().unwrap();

        let reopened = Trie::from_root(storage.clone(), root).unwrap();
        let root_node = reopened.root.resolve(&storage).unwrap().unwrap();
        let (lost, edge_key) = if root_node.left.size >= root_node.right.size {
            (root_node.left.hash, [0u8])
        } else {
            (root_node.right.hash, [63u8])
        };
        storage.delete(&node_key(&lost)).unwrap();

        let results: Vec<_> = reopened.iterate().collect();
        assert_eq!(results.last(), Some(&Err(TrieError::MissingNode(lost))));
        assert_eq!(
            reopened.get(&edge_key).unwrap_err(),
            TrieError::MissingNode(lost)
        );
    }
}
