//! A single-file, HDF5-style container engine.
//!
//! The node tree and its attributes live in memory. Chunks are allocated on first write and
//! unallocated chunks read as zero. Chunks already in the backing file are read from it on
//! demand and only kept in memory once modified.
//!
//! # File layout
//!
//! | Bytes | Content |
//! |---|---|
//! | `0..8` | [SIGNATURE] |
//! | `8..12` | format version, `u32` little-endian |
//! | `12..20` | offset of the tree description, `u64` little-endian |
//! | `20..28` | length of the tree description, `u64` little-endian |
//! | `28..` | chunk and attribute payloads, followed by the tree description |
//!
//! The tree description is JSON listing every node, the layout of every dataset and the
//! byte range of every payload. Payloads are binary (see [super::filter]).
//! [Container::flush] writes a new file next to the old one, copying stored chunks without
//! decoding them, and renames it into place.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::filter::{
    AttributeLayout, decode_attribute, decode_chunk, encode_attribute, encode_chunk,
};
use super::{
    Container, DatasetInfo, Hyperslab, NativeAttribute, NativeId, NativeType, StorageFeatures,
};
use crate::block::DataBuffer;

/// Leading bytes of every container file.
pub const SIGNATURE: [u8; 8] = [0x89, b'N', b'5', b'H', b'\r', b'\n', 0x1a, b'\n'];

const FORMAT_VERSION: u32 = 2;

const HEADER_LEN: u64 = 28;

/// Byte range of a payload in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Section {
    offset: u64,
    length: u64,
}

#[derive(Debug)]
enum Chunk {
    /// Still encoded in the backing file.
    Stored(Section),
    Loaded(DataBuffer),
}

impl Chunk {
    fn stored(&self) -> Option<Section> {
        match self {
            Chunk::Stored(section) => Some(*section),
            Chunk::Loaded(_) => None,
        }
    }
}

#[derive(Debug)]
struct Dataset {
    dimensions: Vec<u64>,
    /// Allocation unit; the full (non-zero) shape for contiguous datasets.
    chunk_shape: Vec<u64>,
    contiguous: bool,
    native_type: NativeType,
    features: StorageFeatures,
    /// Full-size chunks keyed by their C-order index in the chunk grid.
    chunks: BTreeMap<u64, Chunk>,
}

impl Dataset {
    fn chunk_len(&self) -> usize {
        self.chunk_shape.iter().map(|&c| c as usize).product()
    }

    fn grid_shape(&self) -> Vec<u64> {
        self.dimensions
            .iter()
            .zip(&self.chunk_shape)
            .map(|(&d, &c)| d.div_ceil(c))
            .collect()
    }

    /// Whether `region` overwrites its whole chunk.
    fn covers_chunk(&self, region: &ChunkRegion) -> bool {
        region.in_chunk.iter().all(|&o| o == 0) && region.extent == self.chunk_shape
    }
}

#[derive(Debug, Default)]
struct Node {
    attributes: BTreeMap<String, NativeAttribute>,
    dataset: Option<Dataset>,
}

#[derive(Debug, Clone)]
enum OpenObject {
    Dataset(String),
    TransferProperties,
}

#[derive(Debug)]
struct State {
    nodes: BTreeMap<String, Node>,
    open: HashMap<NativeId, OpenObject>,
    closed: bool,
}

impl State {
    fn empty() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::default());
        Self {
            nodes,
            open: HashMap::new(),
            closed: false,
        }
    }

    fn check_open(&self) -> crate::Result<()> {
        if self.closed {
            Err(crate::Error::Closed)
        } else {
            Ok(())
        }
    }

    fn node(&self, path: &str) -> crate::Result<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| crate::Error::not_found(path))
    }

    fn node_mut(&mut self, path: &str) -> crate::Result<&mut Node> {
        self.nodes
            .get_mut(path)
            .ok_or_else(|| crate::Error::not_found(path))
    }

    fn dataset(&self, path: &str) -> crate::Result<&Dataset> {
        self.node(path)?
            .dataset
            .as_ref()
            .ok_or_else(|| crate::Error::native(format!("{path} is not a dataset")))
    }

    fn open_dataset_path(&self, id: NativeId) -> crate::Result<&str> {
        match self.open.get(&id) {
            Some(OpenObject::Dataset(path)) => Ok(path),
            _ => Err(crate::Error::native(format!("{id} is not an open dataset"))),
        }
    }

    fn check_transfer(&self, id: NativeId) -> crate::Result<()> {
        match self.open.get(&id) {
            Some(OpenObject::TransferProperties) => Ok(()),
            _ => Err(crate::Error::native(format!(
                "{id} is not an open transfer property list"
            ))),
        }
    }

    /// Create missing groups from the root down to and including `path`.
    fn ensure_groups(&mut self, path: &str) -> crate::Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            match self.nodes.get(&current) {
                Some(node) if node.dataset.is_some() => {
                    return Err(crate::Error::native(format!(
                        "{current} is a dataset, not a group"
                    )));
                }
                Some(_) => {}
                None => {
                    self.nodes.insert(current.clone(), Node::default());
                }
            }
        }
        Ok(())
    }
}

/// Persisted description of the node tree.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Tree {
    nodes: BTreeMap<String, PersistedNode>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedNode {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, PersistedAttribute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dataset: Option<PersistedDataset>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedAttribute {
    layout: AttributeLayout,
    native_type: NativeType,
    data: Section,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedDataset {
    dimensions: Vec<u64>,
    chunk_shape: Vec<u64>,
    contiguous: bool,
    native_type: NativeType,
    features: StorageFeatures,
    chunks: BTreeMap<u64, Section>,
}

impl PersistedDataset {
    fn into_dataset(self, file_len: u64) -> crate::Result<Dataset> {
        if self.chunk_shape.len() != self.dimensions.len() || self.chunk_shape.contains(&0) {
            return Err(crate::Error::native(format!(
                "invalid chunk shape {:?} for dimensions {:?}",
                self.chunk_shape, self.dimensions
            )));
        }
        let chunks = self
            .chunks
            .into_iter()
            .map(|(key, section)| {
                check_section(section, file_len)?;
                Ok((key, Chunk::Stored(section)))
            })
            .collect::<crate::Result<_>>()?;
        Ok(Dataset {
            dimensions: self.dimensions,
            chunk_shape: self.chunk_shape,
            contiguous: self.contiguous,
            native_type: self.native_type,
            features: self.features,
            chunks,
        })
    }
}

fn encode_header(tree: Section) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN as usize);
    out.put_slice(&SIGNATURE);
    out.put_u32_le(FORMAT_VERSION);
    out.put_u64_le(tree.offset);
    out.put_u64_le(tree.length);
    out
}

/// Location of the tree description; the signature must already have been checked.
fn decode_header(mut header: &[u8]) -> crate::Result<Section> {
    header.advance(SIGNATURE.len());
    let format = header.get_u32_le();
    if format != FORMAT_VERSION {
        return Err(crate::Error::native(format!(
            "unknown container format version {format}"
        )));
    }
    Ok(Section {
        offset: header.get_u64_le(),
        length: header.get_u64_le(),
    })
}

fn check_section(section: Section, file_len: u64) -> crate::Result<()> {
    let inside = section.offset >= HEADER_LEN
        && section
            .offset
            .checked_add(section.length)
            .is_some_and(|end| end <= file_len);
    if inside {
        Ok(())
    } else {
        Err(crate::Error::native(format!(
            "payload at {} of {} bytes lies outside the file",
            section.offset, section.length
        )))
    }
}

fn read_section(file: &mut File, section: Section) -> crate::Result<Vec<u8>> {
    let length = usize::try_from(section.length)
        .map_err(|_| crate::Error::native("payload does not fit in memory"))?;
    file.seek(SeekFrom::Start(section.offset))?;
    let mut out = vec![0; length];
    file.read_exact(&mut out)?;
    Ok(out)
}

/// Sibling path a new image is written to before replacing the old one.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Appends payloads to a new image.
struct ImageWriter {
    out: BufWriter<File>,
    offset: u64,
}

impl ImageWriter {
    fn create(path: &Path) -> crate::Result<Self> {
        let mut out = BufWriter::new(File::create(path)?);
        // placeholder until the tree description is written
        out.write_all(&encode_header(Section {
            offset: 0,
            length: 0,
        }))?;
        Ok(Self {
            out,
            offset: HEADER_LEN,
        })
    }

    fn append(&mut self, bytes: &[u8]) -> crate::Result<Section> {
        self.out.write_all(bytes)?;
        let section = Section {
            offset: self.offset,
            length: bytes.len() as u64,
        };
        self.offset += section.length;
        Ok(section)
    }

    fn finish(self, tree: Section) -> crate::Result<()> {
        let mut file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(tree))?;
        file.sync_all()?;
        Ok(())
    }
}

/// New location of a chunk after an image was written.
struct StoredChunk {
    path: String,
    key: u64,
    section: Section,
}

/// Write the whole tree to `staging`, reading stored chunks from `old`.
fn write_image(
    state: &State,
    mut old: Option<&mut File>,
    staging: &Path,
) -> crate::Result<Vec<StoredChunk>> {
    let mut writer = ImageWriter::create(staging)?;
    let mut tree = Tree::default();
    let mut stored = Vec::new();
    for (path, node) in &state.nodes {
        let mut persisted = PersistedNode::default();
        for (name, attr) in &node.attributes {
            let (layout, native_type, bytes) = encode_attribute(attr)?;
            persisted.attributes.insert(
                name.clone(),
                PersistedAttribute {
                    layout,
                    native_type,
                    data: writer.append(&bytes)?,
                },
            );
        }
        if let Some(ds) = &node.dataset {
            let mut chunks = BTreeMap::new();
            for (&key, chunk) in &ds.chunks {
                let bytes = match chunk {
                    Chunk::Loaded(buffer) => encode_chunk(buffer, ds.features)?,
                    Chunk::Stored(section) => {
                        let file = old.as_deref_mut().ok_or_else(|| {
                            crate::Error::native(format!(
                                "chunk {key} of {path} has no backing file"
                            ))
                        })?;
                        read_section(file, *section)?
                    }
                };
                let section = writer.append(&bytes)?;
                chunks.insert(key, section);
                stored.push(StoredChunk {
                    path: path.clone(),
                    key,
                    section,
                });
            }
            persisted.dataset = Some(PersistedDataset {
                dimensions: ds.dimensions.clone(),
                chunk_shape: ds.chunk_shape.clone(),
                contiguous: ds.contiguous,
                native_type: ds.native_type,
                features: ds.features,
                chunks,
            });
        }
        tree.nodes.insert(path.clone(), persisted);
    }
    let tree_section = writer.append(&serde_json::to_vec(&tree)?)?;
    writer.finish(tree_section)?;
    Ok(stored)
}

/// Part of a hyperslab selection that falls into one chunk.
struct ChunkRegion {
    key: u64,
    /// Region origin relative to the chunk origin.
    in_chunk: Vec<u64>,
    /// Region origin relative to the selection origin.
    in_selection: Vec<u64>,
    extent: Vec<u64>,
}

/// Visit every chunk intersecting `selection`.
fn for_each_chunk(
    ds: &Dataset,
    selection: &Hyperslab,
    mut f: impl FnMut(ChunkRegion) -> crate::Result<()>,
) -> crate::Result<()> {
    if selection.extent.contains(&0) {
        return Ok(());
    }
    let ndim = ds.dimensions.len();
    let grid_shape = ds.grid_shape();
    let first: Vec<u64> = (0..ndim)
        .map(|i| selection.offset[i] / ds.chunk_shape[i])
        .collect();
    let last: Vec<u64> = (0..ndim)
        .map(|i| (selection.offset[i] + selection.extent[i] - 1) / ds.chunk_shape[i])
        .collect();
    let mut index = first.clone();
    loop {
        let mut key = 0u64;
        let mut in_chunk = Vec::with_capacity(ndim);
        let mut in_selection = Vec::with_capacity(ndim);
        let mut extent = Vec::with_capacity(ndim);
        for i in 0..ndim {
            key = key * grid_shape[i] + index[i];
            let origin = index[i] * ds.chunk_shape[i];
            let start = origin.max(selection.offset[i]);
            let end = (origin + ds.chunk_shape[i]).min(selection.offset[i] + selection.extent[i]);
            in_chunk.push(start - origin);
            in_selection.push(start - selection.offset[i]);
            extent.push(end - start);
        }
        f(ChunkRegion {
            key,
            in_chunk,
            in_selection,
            extent,
        })?;

        let mut axis = ndim;
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            if index[axis] < last[axis] {
                index[axis] += 1;
                break;
            }
            index[axis] = first[axis];
        }
    }
}

fn check_io(ds: &Dataset, selection: &Hyperslab, buffer: &DataBuffer) -> crate::Result<()> {
    if !selection.fits(&ds.dimensions) {
        return Err(crate::Error::native(format!(
            "selection at {:?} of extent {:?} does not fit dataset of shape {:?}",
            selection.offset, selection.extent, ds.dimensions
        )));
    }
    if buffer.native_type() != ds.native_type {
        return Err(crate::Error::native(format!(
            "memory type {:?} does not match dataset type {:?}",
            buffer.native_type(),
            ds.native_type
        )));
    }
    if buffer.len() != selection.num_elements() {
        return Err(crate::Error::native(format!(
            "buffer holds {} elements, selection has {}",
            buffer.len(),
            selection.num_elements()
        )));
    }
    Ok(())
}

fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Container engine persisted to a single file.
#[derive(Debug)]
pub struct FileContainer {
    path: Option<PathBuf>,
    read_only: bool,
    state: RwLock<State>,
    /// Open image that stored chunks are read from. Locked after `state`.
    backing: Mutex<Option<File>>,
    next_id: AtomicU64,
}

impl FileContainer {
    fn with_state(
        path: Option<PathBuf>,
        read_only: bool,
        state: State,
        backing: Option<File>,
    ) -> Self {
        Self {
            path,
            read_only,
            state: RwLock::new(state),
            backing: Mutex::new(backing),
            next_id: AtomicU64::new(1),
        }
    }

    /// A container with no backing file.
    pub fn in_memory() -> Self {
        Self::with_state(None, false, State::empty(), None)
    }

    /// Create an empty container, replacing any file at `path`.
    pub fn create(path: impl AsRef<Path>) -> crate::Result<Self> {
        let out = Self::with_state(
            Some(path.as_ref().to_path_buf()),
            false,
            State::empty(),
            None,
        );
        out.flush()?;
        Ok(out)
    }

    /// Open the container at `path` for writing, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Self::create(path);
        }
        let (state, file) = Self::load(path)?;
        Ok(Self::with_state(
            Some(path.to_path_buf()),
            false,
            state,
            Some(file),
        ))
    }

    /// Open an existing container without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let (state, file) = Self::load(path)?;
        Ok(Self::with_state(
            Some(path.to_path_buf()),
            true,
            state,
            Some(file),
        ))
    }

    /// Whether `path` is a regular file starting with the container signature.
    pub fn is_container_file(path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        if !path.is_file() {
            return false;
        }
        let mut sig = [0u8; SIGNATURE.len()];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut sig))
            .is_ok_and(|_| sig == SIGNATURE)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of native objects currently open.
    pub fn open_object_count(&self) -> usize {
        self.state.read().open.len()
    }

    /// Read the tree and attributes of the image at `path`; chunks stay in the file.
    fn load(path: &Path) -> crate::Result<(State, File)> {
        if !Self::is_container_file(path) {
            return Err(crate::Error::general(format!(
                "file exists at {} and is not a valid container file",
                path.display()
            )));
        }
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact(&mut header)
            .map_err(|_| crate::Error::native("container header is truncated"))?;
        let tree_section = decode_header(&header)?;
        check_section(tree_section, file_len)?;
        let tree: Tree = serde_json::from_slice(&read_section(&mut file, tree_section)?)?;

        let mut state = State::empty();
        for (node_path, node) in tree.nodes {
            let mut attributes = BTreeMap::new();
            for (name, attr) in node.attributes {
                check_section(attr.data, file_len)?;
                let bytes = read_section(&mut file, attr.data)?;
                attributes.insert(
                    name,
                    decode_attribute(attr.layout, attr.native_type, &bytes)?,
                );
            }
            let dataset = node
                .dataset
                .map(|ds| ds.into_dataset(file_len))
                .transpose()?;
            state
                .nodes
                .insert(node_path, Node { attributes, dataset });
        }
        log::debug!("loaded {} nodes from {}", state.nodes.len(), path.display());
        Ok((state, file))
    }

    fn load_chunk(&self, ds: &Dataset, section: Section) -> crate::Result<DataBuffer> {
        let bytes = {
            let mut backing = self.backing.lock();
            let file = backing
                .as_mut()
                .ok_or_else(|| crate::Error::native("container has no backing file"))?;
            read_section(file, section)?
        };
        decode_chunk(&bytes, ds.native_type, ds.features, ds.chunk_len())
    }

    fn allocate_id(&self) -> NativeId {
        NativeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn check_writable(&self) -> crate::Result<()> {
        if self.read_only {
            Err(crate::Error::ReadOnly)
        } else {
            Ok(())
        }
    }
}

impl Container for FileContainer {
    fn exists(&self, path: &str) -> crate::Result<bool> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.nodes.contains_key(path))
    }

    fn is_dataset(&self, path: &str) -> crate::Result<bool> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.nodes.get(path).is_some_and(|n| n.dataset.is_some()))
    }

    fn is_group(&self, path: &str) -> crate::Result<bool> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.nodes.get(path).is_some_and(|n| n.dataset.is_none()))
    }

    fn group_members(&self, path: &str) -> crate::Result<Vec<String>> {
        let state = self.state.read();
        state.check_open()?;
        if state.node(path)?.dataset.is_some() {
            return Err(crate::Error::native(format!("{path} is not a group")));
        }
        Ok(state
            .nodes
            .keys()
            .filter(|k| parent(k) == Some(path))
            .filter_map(|k| k.rsplit('/').next().map(str::to_string))
            .collect())
    }

    fn create_group(&self, path: &str) -> crate::Result<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        state.check_open()?;
        state.ensure_groups(path)
    }

    fn delete(&self, path: &str) -> crate::Result<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        state.check_open()?;
        if path == "/" {
            return Err(crate::Error::native("the root group cannot be deleted"));
        }
        if state.nodes.remove(path).is_none() {
            return Err(crate::Error::not_found(path));
        }
        state.nodes.retain(|k, _| !is_descendant(k, path));
        Ok(())
    }

    fn create_array(
        &self,
        path: &str,
        dimensions: &[u64],
        chunk_shape: Option<&[u64]>,
        native_type: NativeType,
        features: StorageFeatures,
    ) -> crate::Result<()> {
        self.check_writable()?;
        if native_type == NativeType::Bool {
            return Err(crate::Error::native("boolean datasets are not supported"));
        }
        if !features.applies_to(native_type) {
            return Err(crate::Error::native(format!(
                "storage features {features:?} cannot be applied to {native_type:?}"
            )));
        }
        let (chunk_shape, contiguous) = match chunk_shape {
            Some(c) => {
                if c.len() != dimensions.len() {
                    return Err(crate::Error::DimensionMismatch {
                        expected: dimensions.len(),
                        actual: c.len(),
                    });
                }
                if c.contains(&0) {
                    return Err(crate::Error::native("chunk dimensions must be positive"));
                }
                (c.to_vec(), false)
            }
            None => (dimensions.iter().map(|&d| d.max(1)).collect(), true),
        };

        let mut state = self.state.write();
        state.check_open()?;
        if state.nodes.contains_key(path) {
            return Err(crate::Error::native(format!("{path} already exists")));
        }
        if let Some(p) = parent(path) {
            state.ensure_groups(p)?;
        }
        state.nodes.insert(
            path.to_string(),
            Node {
                attributes: BTreeMap::new(),
                dataset: Some(Dataset {
                    dimensions: dimensions.to_vec(),
                    chunk_shape,
                    contiguous,
                    native_type,
                    features,
                    chunks: BTreeMap::new(),
                }),
            },
        );
        Ok(())
    }

    fn dataset_info(&self, path: &str) -> crate::Result<DatasetInfo> {
        let state = self.state.read();
        state.check_open()?;
        let ds = state.dataset(path)?;
        Ok(DatasetInfo {
            dimensions: ds.dimensions.clone(),
            chunk_shape: (!ds.contiguous).then(|| ds.chunk_shape.clone()),
            native_type: ds.native_type,
        })
    }

    fn open_dataset(&self, path: &str) -> crate::Result<NativeId> {
        let mut state = self.state.write();
        state.check_open()?;
        state.dataset(path)?;
        let id = self.allocate_id();
        state.open.insert(id, OpenObject::Dataset(path.to_string()));
        Ok(id)
    }

    fn close_dataset(&self, id: NativeId) -> crate::Result<()> {
        let mut state = self.state.write();
        match state.open.remove(&id) {
            Some(OpenObject::Dataset(_)) => Ok(()),
            Some(other) => {
                state.open.insert(id, other);
                Err(crate::Error::native(format!("{id} is not a dataset")))
            }
            None => Err(crate::Error::native(format!("{id} is not open"))),
        }
    }

    fn create_transfer_properties(&self) -> crate::Result<NativeId> {
        let mut state = self.state.write();
        state.check_open()?;
        let id = self.allocate_id();
        state.open.insert(id, OpenObject::TransferProperties);
        Ok(id)
    }

    fn close_transfer_properties(&self, id: NativeId) -> crate::Result<()> {
        let mut state = self.state.write();
        match state.open.remove(&id) {
            Some(OpenObject::TransferProperties) => Ok(()),
            Some(other) => {
                state.open.insert(id, other);
                Err(crate::Error::native(format!(
                    "{id} is not a transfer property list"
                )))
            }
            None => Err(crate::Error::native(format!("{id} is not open"))),
        }
    }

    fn read_hyperslab(
        &self,
        dataset: NativeId,
        transfer: NativeId,
        selection: &Hyperslab,
        buffer: &mut DataBuffer,
    ) -> crate::Result<()> {
        let state = self.state.read();
        state.check_open()?;
        state.check_transfer(transfer)?;
        let ds = state.dataset(state.open_dataset_path(dataset)?)?;
        check_io(ds, selection, buffer)?;

        *buffer = DataBuffer::zeros(ds.native_type, buffer.len())?;
        for_each_chunk(ds, selection, |region| {
            let loaded;
            let chunk = match ds.chunks.get(&region.key) {
                None => return Ok(()),
                Some(Chunk::Loaded(chunk)) => chunk,
                Some(Chunk::Stored(section)) => {
                    loaded = self.load_chunk(ds, *section)?;
                    &loaded
                }
            };
            buffer.copy_region_from(
                &selection.extent,
                &region.in_selection,
                chunk,
                &ds.chunk_shape,
                &region.in_chunk,
                &region.extent,
            )
        })
    }

    fn write_hyperslab(
        &self,
        dataset: NativeId,
        transfer: NativeId,
        selection: &Hyperslab,
        buffer: &DataBuffer,
    ) -> crate::Result<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        state.check_open()?;
        state.check_transfer(transfer)?;
        let path = state.open_dataset_path(dataset)?.to_string();
        let ds = state
            .node_mut(&path)?
            .dataset
            .as_mut()
            .ok_or_else(|| crate::Error::native(format!("{path} is not a dataset")))?;
        check_io(ds, selection, buffer)?;

        let mut regions = Vec::new();
        for_each_chunk(ds, selection, |region| {
            regions.push(region);
            Ok(())
        })?;
        for region in regions {
            let mut chunk = match ds.chunks.get(&region.key).map(Chunk::stored) {
                Some(None) => None,
                Some(Some(section)) if !ds.covers_chunk(&region) => {
                    Some(self.load_chunk(ds, section)?)
                }
                _ => Some(DataBuffer::zeros(ds.native_type, ds.chunk_len())?),
            };
            if let Some(chunk) = chunk.take() {
                ds.chunks.insert(region.key, Chunk::Loaded(chunk));
            }
            let Some(Chunk::Loaded(chunk)) = ds.chunks.get_mut(&region.key) else {
                continue;
            };
            chunk.copy_region_from(
                &ds.chunk_shape,
                &region.in_chunk,
                buffer,
                &selection.extent,
                &region.in_selection,
                &region.extent,
            )?;
        }
        Ok(())
    }

    fn attribute_names(&self, path: &str) -> crate::Result<Vec<String>> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.node(path)?.attributes.keys().cloned().collect())
    }

    fn has_attribute(&self, path: &str, key: &str) -> crate::Result<bool> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.node(path)?.attributes.contains_key(key))
    }

    fn get_attribute(&self, path: &str, key: &str) -> crate::Result<Option<NativeAttribute>> {
        let state = self.state.read();
        state.check_open()?;
        Ok(state.node(path)?.attributes.get(key).cloned())
    }

    fn set_attribute(&self, path: &str, key: &str, value: &NativeAttribute) -> crate::Result<()> {
        self.check_writable()?;
        let mut state = self.state.write();
        state.check_open()?;
        state
            .node_mut(path)?
            .attributes
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn delete_attribute(&self, path: &str, key: &str) -> crate::Result<bool> {
        self.check_writable()?;
        let mut state = self.state.write();
        state.check_open()?;
        Ok(state.node_mut(path)?.attributes.remove(key).is_some())
    }

    fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn flush(&self) -> crate::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if self.read_only {
            return Ok(());
        }
        let mut state = self.state.write();
        state.check_open()?;
        let mut backing = self.backing.lock();

        let staging = staging_path(path);
        let stored = match write_image(&state, backing.as_mut(), &staging) {
            Ok(stored) => stored,
            Err(e) => {
                fs::remove_file(&staging).ok();
                return Err(e);
            }
        };
        *backing = None;
        fs::rename(&staging, path)?;
        *backing = Some(File::open(path)?);

        // chunks now live in the new image
        for StoredChunk {
            path: node_path,
            key,
            section,
        } in stored
        {
            if let Some(ds) = state
                .nodes
                .get_mut(&node_path)
                .and_then(|n| n.dataset.as_mut())
            {
                ds.chunks.insert(key, Chunk::Stored(section));
            }
        }
        log::trace!("flushed container to {}", path.display());
        Ok(())
    }

    fn close(&self) -> crate::Result<()> {
        if self.state.read().closed {
            return Ok(());
        }
        self.flush()?;
        let mut state = self.state.write();
        if !state.open.is_empty() {
            log::warn!(
                "closing container with {} native objects still open",
                state.open.len()
            );
            state.open.clear();
        }
        state.closed = true;
        *self.backing.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_dataset(c: &FileContainer, path: &str) -> NativeId {
        c.create_array(
            path,
            &[5, 7],
            Some(&[2, 3]),
            NativeType::Int32,
            StorageFeatures::NoCompression,
        )
        .unwrap();
        c.open_dataset(path).unwrap()
    }

    #[test]
    fn paths() {
        assert_eq!(parent("/"), None);
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/a/b"), Some("/a"));
        assert!(is_descendant("/a/b", "/a"));
        assert!(!is_descendant("/ab", "/a"));
        assert!(is_descendant("/a", "/"));
    }

    #[test]
    fn groups_and_members() {
        let c = FileContainer::in_memory();
        c.create_group("/a/b/c").unwrap();
        c.create_group("/a/d").unwrap();
        assert!(c.is_group("/a/b").unwrap());
        assert_eq!(c.group_members("/a").unwrap(), vec!["b", "d"]);
        assert_eq!(c.group_members("/").unwrap(), vec!["a"]);
        c.delete("/a/b").unwrap();
        assert!(!c.exists("/a/b/c").unwrap());
        assert!(c.exists("/a/d").unwrap());
        assert!(c.delete("/").is_err());
    }

    #[test]
    fn hyperslab_across_chunks() {
        let c = FileContainer::in_memory();
        let ds = int_dataset(&c, "/data");
        let xfer = c.create_transfer_properties().unwrap();

        let slab = Hyperslab::new(vec![1, 2], vec![3, 4]).unwrap();
        let values = DataBuffer::Int32((0..12).collect());
        c.write_hyperslab(ds, xfer, &slab, &values).unwrap();

        let mut out = DataBuffer::zeros(NativeType::Int32, 12).unwrap();
        c.read_hyperslab(ds, xfer, &slab, &mut out).unwrap();
        assert_eq!(out, values);

        // the surrounding elements stay zero
        let whole = Hyperslab::new(vec![0, 0], vec![5, 7]).unwrap();
        let mut all = DataBuffer::zeros(NativeType::Int32, 35).unwrap();
        c.read_hyperslab(ds, xfer, &whole, &mut all).unwrap();
        let DataBuffer::Int32(all) = all else {
            panic!("wrong type")
        };
        assert_eq!(all[0..7], [0; 7]);
        assert_eq!(all[7..14], [0, 0, 0, 1, 2, 3, 0]);
        assert_eq!(all[28..35], [0; 7]);
    }

    #[test]
    fn hyperslab_checks() {
        let c = FileContainer::in_memory();
        let ds = int_dataset(&c, "/data");
        let xfer = c.create_transfer_properties().unwrap();

        let outside = Hyperslab::new(vec![4, 0], vec![2, 1]).unwrap();
        let mut buf = DataBuffer::zeros(NativeType::Int32, 2).unwrap();
        assert!(c.read_hyperslab(ds, xfer, &outside, &mut buf).is_err());

        let slab = Hyperslab::new(vec![0, 0], vec![1, 2]).unwrap();
        let mut wrong_type = DataBuffer::zeros(NativeType::Int64, 2).unwrap();
        assert!(c.read_hyperslab(ds, xfer, &slab, &mut wrong_type).is_err());
        assert!(c.read_hyperslab(ds, ds, &slab, &mut buf).is_err());
    }

    #[test]
    fn handles_are_tracked() {
        let c = FileContainer::in_memory();
        let ds = int_dataset(&c, "/data");
        assert_eq!(c.open_object_count(), 1);
        c.close_dataset(ds).unwrap();
        assert!(c.close_dataset(ds).is_err());
        assert_eq!(c.open_object_count(), 0);
        assert!(c.open_dataset("/missing").is_err());
    }

    #[test]
    fn persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.n5h");
        {
            let c = FileContainer::create(&path).unwrap();
            c.create_array(
                "/g/data",
                &[4],
                Some(&[3]),
                NativeType::Float32,
                StorageFeatures::ShuffleDeflate { level: 6 },
            )
            .unwrap();
            c.set_attribute(
                "/g",
                "answer",
                &NativeAttribute::Scalar {
                    value: super::super::NativeScalar::Int64(42),
                },
            )
            .unwrap();
            let ds = c.open_dataset("/g/data").unwrap();
            let xfer = c.create_transfer_properties().unwrap();
            let slab = Hyperslab::new(vec![0], vec![4]).unwrap();
            c.write_hyperslab(ds, xfer, &slab, &DataBuffer::Float32(vec![1.0, 2.0, 3.0, 4.0]))
                .unwrap();
            c.close_dataset(ds).unwrap();
            c.close_transfer_properties(xfer).unwrap();
            c.close().unwrap();
            assert!(matches!(c.exists("/g"), Err(crate::Error::Closed)));
        }
        assert!(FileContainer::is_container_file(&path));

        let c = FileContainer::open_read_only(&path).unwrap();
        assert!(c.is_dataset("/g/data").unwrap());
        assert!(c.get_attribute("/g", "answer").unwrap().is_some());
        let ds = c.open_dataset("/g/data").unwrap();
        let xfer = c.create_transfer_properties().unwrap();
        let slab = Hyperslab::new(vec![1], vec![3]).unwrap();
        let mut out = DataBuffer::zeros(NativeType::Float32, 3).unwrap();
        c.read_hyperslab(ds, xfer, &slab, &mut out).unwrap();
        assert_eq!(out, DataBuffer::Float32(vec![2.0, 3.0, 4.0]));
        assert!(matches!(c.create_group("/x"), Err(crate::Error::ReadOnly)));
    }

    fn chunk_states(c: &FileContainer, path: &str) -> Vec<bool> {
        let state = c.state.read();
        let ds = state.dataset(path).unwrap();
        ds.chunks.values().map(|c| c.stored().is_some()).collect()
    }

    fn read_all(c: &FileContainer, path: &str, len: u64) -> DataBuffer {
        let ds = c.open_dataset(path).unwrap();
        let xfer = c.create_transfer_properties().unwrap();
        let mut out = DataBuffer::zeros(NativeType::Int32, len as usize).unwrap();
        c.read_hyperslab(ds, xfer, &Hyperslab::new(vec![0], vec![len]).unwrap(), &mut out)
            .unwrap();
        c.close_dataset(ds).unwrap();
        c.close_transfer_properties(xfer).unwrap();
        out
    }

    #[test]
    fn stored_chunks_load_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lazy.n5h");
        {
            let c = FileContainer::create(&path).unwrap();
            c.create_array(
                "/data",
                &[6],
                Some(&[2]),
                NativeType::Int32,
                StorageFeatures::ShuffleDeflate { level: 6 },
            )
            .unwrap();
            let ds = c.open_dataset("/data").unwrap();
            let xfer = c.create_transfer_properties().unwrap();
            let slab = Hyperslab::new(vec![0], vec![6]).unwrap();
            c.write_hyperslab(ds, xfer, &slab, &DataBuffer::Int32((1..=6).collect()))
                .unwrap();
            assert_eq!(chunk_states(&c, "/data"), vec![false; 3]);
            c.close().unwrap();
        }

        let c = FileContainer::open(&path).unwrap();
        assert_eq!(chunk_states(&c, "/data"), vec![true; 3]);
        // reading does not keep decoded chunks
        assert_eq!(read_all(&c, "/data", 6), DataBuffer::Int32((1..=6).collect()));
        assert_eq!(chunk_states(&c, "/data"), vec![true; 3]);

        let ds = c.open_dataset("/data").unwrap();
        let xfer = c.create_transfer_properties().unwrap();
        // one element of the middle chunk, then the whole last chunk
        let one = Hyperslab::new(vec![3], vec![1]).unwrap();
        c.write_hyperslab(ds, xfer, &one, &DataBuffer::Int32(vec![40]))
            .unwrap();
        let last = Hyperslab::new(vec![4], vec![2]).unwrap();
        c.write_hyperslab(ds, xfer, &last, &DataBuffer::Int32(vec![50, 60]))
            .unwrap();
        c.close_dataset(ds).unwrap();
        c.close_transfer_properties(xfer).unwrap();
        assert_eq!(chunk_states(&c, "/data"), vec![true, false, false]);

        let expected = DataBuffer::Int32(vec![1, 2, 3, 40, 50, 60]);
        assert_eq!(read_all(&c, "/data", 6), expected);
        c.flush().unwrap();
        assert_eq!(chunk_states(&c, "/data"), vec![true; 3]);
        assert_eq!(read_all(&c, "/data", 6), expected);
        c.close().unwrap();
        assert!(!staging_path(&path).exists());

        let c = FileContainer::open_read_only(&path).unwrap();
        assert_eq!(read_all(&c, "/data", 6), expected);
    }

    #[test]
    fn non_finite_attributes_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floats.n5h");
        let scalar = NativeAttribute::Scalar {
            value: super::super::NativeScalar::Float64(f64::NEG_INFINITY),
        };
        let array = NativeAttribute::Array {
            values: DataBuffer::Float32(vec![f32::INFINITY, 1.5, f32::NEG_INFINITY]),
        };
        let matrix = NativeAttribute::Matrix {
            rows: 2,
            cols: 0,
            values: DataBuffer::Int32(vec![]),
        };
        {
            let c = FileContainer::create(&path).unwrap();
            c.set_attribute("/", "scalar", &scalar).unwrap();
            c.set_attribute("/", "array", &array).unwrap();
            c.set_attribute("/", "matrix", &matrix).unwrap();
            c.set_attribute(
                "/",
                "nan",
                &NativeAttribute::Matrix {
                    rows: 1,
                    cols: 2,
                    values: DataBuffer::Float64(vec![f64::NAN, 0.0]),
                },
            )
            .unwrap();
            c.close().unwrap();
        }

        let c = FileContainer::open_read_only(&path).unwrap();
        assert_eq!(c.get_attribute("/", "scalar").unwrap(), Some(scalar));
        assert_eq!(c.get_attribute("/", "array").unwrap(), Some(array));
        assert_eq!(c.get_attribute("/", "matrix").unwrap(), Some(matrix));
        let Some(NativeAttribute::Matrix {
            rows: 1,
            cols: 2,
            values: DataBuffer::Float64(values),
        }) = c.get_attribute("/", "nan").unwrap()
        else {
            panic!("wrong attribute layout")
        };
        assert!(values[0].is_nan());
        assert_eq!(values[1], 0.0);
    }

    #[test]
    fn rejects_truncated_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.n5h");
        {
            let c = FileContainer::create(&path).unwrap();
            c.create_group("/a").unwrap();
            c.close().unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 1).unwrap();
        drop(file);
        assert!(FileContainer::is_container_file(&path));
        assert!(FileContainer::open_read_only(&path).is_err());

        // signature only
        fs::write(&path, SIGNATURE).unwrap();
        assert!(FileContainer::open(&path).is_err());
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.txt");
        fs::write(&path, b"not a container").unwrap();
        assert!(!FileContainer::is_container_file(&path));
        assert!(FileContainer::open(&path).is_err());
    }
}
