use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::api::{N5Reader, N5Writer};
use crate::attributes::{AttributeCodec, AttributeKind, AttributeValue};
use crate::axis;
use crate::block::{self, DataBlock, DataBuffer};
use crate::config::StoreOptions;
use crate::container::{Container, FileContainer, Hyperslab};
use crate::handle_cache::HandleCache;
use crate::metadata::{self, DatasetAttributes, N5Compression};
use crate::native;

/// Attribute keys derived from the native dataset instead of being stored.
const DATASET_KEYS: [&str; 4] = ["dimensions", "blockSize", "dataType", "compression"];

/// Resolve `path` to an absolute container path.
///
/// Empty, `.` and `..` segments are resolved; `""` and `"/"` are the root.
pub fn normalize_path(path: &str) -> String {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// An N5 store backed by a [Container].
///
/// N5 vectors are in F axis order and are reversed on their way to the container.
/// Compression is not recoverable from the container; datasets always report
/// [N5Compression::Raw].
#[derive(Debug)]
pub struct N5Hdf5Store<C: Container> {
    container: Arc<C>,
    handles: HandleCache<C>,
    options: StoreOptions,
    read_only: bool,
}

impl<C: Container> N5Hdf5Store<C> {
    fn new(container: C, options: StoreOptions, read_only: bool) -> crate::Result<Self> {
        let container = Arc::new(container);
        let handles = HandleCache::new(Arc::clone(&container), options.max_open_datasets)?;
        let store = Self {
            container,
            handles,
            options,
            read_only,
        };
        if let Some(version) = store.version()? {
            if !metadata::is_compatible(&version) {
                return Err(crate::Error::IncompatibleVersion {
                    found: version,
                    expected: metadata::VERSION,
                });
            }
        }
        Ok(store)
    }

    /// Open a store that only reads.
    pub fn open_reader(container: C, options: StoreOptions) -> crate::Result<Self> {
        let store = Self::new(container, options, true)?;
        log::debug!("opened reader on {:?}", store.container.file_path());
        Ok(store)
    }

    /// Open a store for reading and writing, stamping the current version on its root.
    pub fn open_writer(container: C, options: StoreOptions) -> crate::Result<Self> {
        let store = Self::new(container, options, false)?;
        if store.version()? != Some(metadata::VERSION) {
            store.codec().set(
                "/",
                metadata::VERSION_KEY,
                metadata::VERSION.to_string().into(),
            )?;
        }
        log::debug!("opened writer on {:?}", store.container.file_path());
        Ok(store)
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn container(&self) -> &C {
        &self.container
    }

    pub fn handle_cache(&self) -> &HandleCache<C> {
        &self.handles
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn codec(&self) -> AttributeCodec<'_, C> {
        AttributeCodec::new(&*self.container)
    }

    fn check_writable(&self) -> crate::Result<()> {
        if self.read_only {
            Err(crate::Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// Value of a derived dataset attribute, if `path` is a dataset and `key` is one.
    fn dataset_key(&self, path: &str, key: &str) -> crate::Result<Option<Value>> {
        if !DATASET_KEYS.contains(&key) {
            return Ok(None);
        }
        let Some(attributes) = self.get_dataset_attributes(path)? else {
            return Ok(None);
        };
        Ok(serde_json::to_value(&attributes)?.get(key).cloned())
    }

    fn hyperslab(offset: &[u64], size: &[u32]) -> crate::Result<Hyperslab> {
        Hyperslab::new(axis::reorder(offset), axis::reorder_to_u64(size))
    }
}

impl N5Hdf5Store<FileContainer> {
    /// Open a writer on a container file, creating it if needed.
    pub fn open_file_writer(path: impl AsRef<Path>, options: StoreOptions) -> crate::Result<Self> {
        Self::open_writer(FileContainer::open(path)?, options)
    }

    /// Open a reader on an existing container file.
    pub fn open_file_reader(path: impl AsRef<Path>, options: StoreOptions) -> crate::Result<Self> {
        Self::open_reader(FileContainer::open_read_only(path)?, options)
    }
}

impl<C: Container> N5Reader for N5Hdf5Store<C> {
    fn version(&self) -> crate::Result<Option<semver::Version>> {
        match self.codec().get::<String>("/", metadata::VERSION_KEY)? {
            Some(v) => Ok(Some(semver::Version::parse(&v)?)),
            None => Ok(None),
        }
    }

    fn exists(&self, path: &str) -> crate::Result<bool> {
        self.container.exists(&normalize_path(path))
    }

    fn list(&self, path: &str) -> crate::Result<Vec<String>> {
        let path = normalize_path(path);
        if self.container.is_dataset(&path)? {
            return Ok(Vec::new());
        }
        if !self.container.is_group(&path)? {
            return Err(crate::Error::not_found(path));
        }
        self.container.group_members(&path)
    }

    fn dataset_exists(&self, path: &str) -> crate::Result<bool> {
        self.container.is_dataset(&normalize_path(path))
    }

    fn get_dataset_attributes(&self, path: &str) -> crate::Result<Option<DatasetAttributes>> {
        let path = normalize_path(path);
        if !self.container.is_dataset(&path)? {
            return Ok(None);
        }
        let info = self.container.dataset_info(&path)?;
        let dimensions = axis::reorder(&info.dimensions);
        let native_block_size = info
            .chunk_shape
            .map(|chunk| {
                chunk
                    .iter()
                    .rev()
                    .map(|&c| {
                        u32::try_from(c).map_err(|_| {
                            crate::Error::native(format!("chunk size {c} of {path} is too large"))
                        })
                    })
                    .collect::<crate::Result<Vec<u32>>>()
            })
            .transpose()?;
        let block_size = self.options.block_size(&dimensions, native_block_size);
        let data_type = native::data_type(info.native_type)?;
        Ok(Some(DatasetAttributes::new(
            dimensions,
            block_size,
            data_type,
            N5Compression::Raw,
        )?))
    }

    fn get_attribute<T: DeserializeOwned>(
        &self,
        path: &str,
        key: &str,
    ) -> crate::Result<Option<T>> {
        let path = normalize_path(path);
        if let Some(value) = self.dataset_key(&path, key)? {
            // fall through to stored attributes if the derived value does not fit
            if let Ok(out) = serde_json::from_value(value) {
                return Ok(Some(out));
            }
        }
        self.codec().get(&path, key)
    }

    fn get_attribute_json(&self, path: &str, key: &str) -> crate::Result<Option<Value>> {
        let path = normalize_path(path);
        if let Some(value) = self.dataset_key(&path, key)? {
            return Ok(Some(value));
        }
        self.codec().get_json(&path, key)
    }

    fn get_attributes(&self, path: &str) -> crate::Result<Map<String, Value>> {
        let path = normalize_path(path);
        let mut out = self.codec().get_all(&path)?;
        if let Some(attributes) = self.get_dataset_attributes(&path)? {
            if let Value::Object(derived) = serde_json::to_value(&attributes)? {
                out.extend(derived);
            }
        }
        Ok(out)
    }

    fn list_attributes(&self, path: &str) -> crate::Result<BTreeMap<String, AttributeKind>> {
        self.codec().list(&normalize_path(path))
    }

    fn read_block(
        &self,
        path: &str,
        attributes: &DatasetAttributes,
        grid_position: &[u64],
    ) -> crate::Result<Option<DataBlock>> {
        let path = normalize_path(path);
        if !self.container.is_dataset(&path)? {
            return Ok(None);
        }
        let cropped = block::crop(grid_position, &attributes.dimensions, &attributes.block_size)?;
        let native_type = native::native_type(attributes.data_type)?;
        let selection = Self::hyperslab(&cropped.offset, &cropped.size)?;
        let mut buffer = DataBuffer::zeros(native_type, selection.num_elements())?;

        let handle = self.handles.acquire(&path)?;
        self.container
            .read_hyperslab(handle.id(), handle.transfer(), &selection, &mut buffer)?;
        log::trace!(
            "read block {grid_position:?} of {path} ({} elements)",
            buffer.len()
        );
        Ok(Some(DataBlock::new(
            cropped.size,
            grid_position.to_vec(),
            buffer,
        )?))
    }

    fn close(&self) -> crate::Result<()> {
        let handles = self.handles.shutdown();
        let container = self.container.close();
        log::debug!("closed store on {:?}", self.container.file_path());
        handles.and(container)
    }
}

impl<C: Container> N5Writer for N5Hdf5Store<C> {
    fn create_group(&self, path: &str) -> crate::Result<()> {
        self.check_writable()?;
        let path = normalize_path(path);
        if self.container.is_dataset(&path)? {
            return Err(crate::Error::general(format!(
                "{path} already exists and is not a group"
            )));
        }
        if self.container.exists(&path)? {
            return Ok(());
        }
        self.container.create_group(&path)
    }

    fn create_dataset(&self, path: &str, attributes: &DatasetAttributes) -> crate::Result<()> {
        self.check_writable()?;
        let path = normalize_path(path);
        let native_type = native::native_type(attributes.data_type)?;
        let features = native::storage_features(&attributes.compression, attributes.data_type)?;

        if self.container.exists(&path)? {
            self.handles.invalidate(&path)?;
            self.container.delete(&path)?;
        }
        let dimensions = axis::reorder(&attributes.dimensions);
        let chunk_shape: Vec<u64> = attributes
            .block_size
            .iter()
            .zip(&attributes.dimensions)
            .rev()
            .map(|(&b, &d)| u64::from(b).min(d.max(1)))
            .collect();
        self.container.create_array(
            &path,
            &dimensions,
            Some(&chunk_shape),
            native_type,
            features,
        )?;
        log::debug!(
            "created {} dataset {path} of shape {:?}",
            attributes.data_type,
            attributes.dimensions
        );
        Ok(())
    }

    fn set_dataset_attributes(
        &self,
        path: &str,
        _attributes: &DatasetAttributes,
    ) -> crate::Result<()> {
        Err(crate::Error::Unsupported(format!(
            "dataset {} cannot be reshaped",
            normalize_path(path)
        )))
    }

    fn set_attribute(
        &self,
        path: &str,
        key: &str,
        value: impl Into<AttributeValue>,
    ) -> crate::Result<()> {
        self.check_writable()?;
        self.codec().set(&normalize_path(path), key, value.into())
    }

    fn remove_attribute(&self, path: &str, key: &str) -> crate::Result<bool> {
        self.check_writable()?;
        self.codec().remove(&normalize_path(path), key)
    }

    fn write_block(
        &self,
        path: &str,
        attributes: &DatasetAttributes,
        block: &DataBlock,
    ) -> crate::Result<()> {
        self.check_writable()?;
        let path = normalize_path(path);
        for len in [block.grid_position.len(), block.size.len()] {
            if len != attributes.num_dimensions() {
                return Err(crate::Error::DimensionMismatch {
                    expected: attributes.num_dimensions(),
                    actual: len,
                });
            }
        }
        // the grid is defined on the nominal block size, not the cropped one
        let offset = axis::reorder_multiply(&block.grid_position, &attributes.block_size);
        let selection = Hyperslab::new(offset, axis::reorder_to_u64(&block.size))?;

        let handle = self.handles.acquire(&path)?;
        self.container
            .write_hyperslab(handle.id(), handle.transfer(), &selection, &block.data)?;
        log::trace!(
            "wrote block {:?} of {path} ({} elements)",
            block.grid_position,
            block.num_elements()
        );
        Ok(())
    }

    fn delete_block(&self, path: &str, grid_position: &[u64]) -> crate::Result<bool> {
        self.check_writable()?;
        let Some(attributes) = self.get_dataset_attributes(path)? else {
            return Ok(false);
        };
        // there is no way to drop a chunk, so the block is zeroed instead
        let cropped = block::crop(grid_position, &attributes.dimensions, &attributes.block_size)?;
        let num_elements = cropped.size.iter().map(|&s| s as usize).product();
        let zeros = DataBuffer::zeros(native::native_type(attributes.data_type)?, num_elements)?;
        let block = DataBlock::new(cropped.size, grid_position.to_vec(), zeros)?;
        self.write_block(path, &attributes, &block)?;
        Ok(true)
    }

    fn remove_path(&self, path: &str) -> crate::Result<bool> {
        self.check_writable()?;
        let path = normalize_path(path);
        if !self.container.exists(&path)? {
            return Ok(false);
        }
        self.handles.invalidate(&path)?;
        if path == "/" {
            for member in self.container.group_members(&path)? {
                self.container.delete(&format!("/{member}"))?;
            }
        } else {
            self.container.delete(&path)?;
        }
        log::debug!("removed {path}");
        Ok(true)
    }

    fn remove(&self) -> crate::Result<bool> {
        self.check_writable()?;
        self.close()?;
        let Some(file) = self.container.file_path() else {
            return Ok(true);
        };
        match std::fs::remove_file(file) {
            Ok(()) => {
                log::debug!("deleted {}", file.display());
                Ok(true)
            }
            Err(e) => {
                log::warn!("could not delete {}: {e}", file.display());
                Ok(false)
            }
        }
    }
}

impl<C: Container> Drop for N5Hdf5Store<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("error closing store: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("//a/./b/"), "/a/b");
        assert_eq!(normalize_path("/a/../b"), "/b");
        assert_eq!(normalize_path("../.."), "/");
    }

    #[test]
    fn version_is_stamped() {
        let store =
            N5Hdf5Store::open_writer(FileContainer::in_memory(), StoreOptions::default()).unwrap();
        assert_eq!(store.version().unwrap(), Some(metadata::VERSION));
    }

    #[test]
    fn reader_rejects_writes() {
        let store =
            N5Hdf5Store::open_reader(FileContainer::in_memory(), StoreOptions::default()).unwrap();
        assert_eq!(store.version().unwrap(), None);
        assert!(matches!(
            store.create_group("/a"),
            Err(crate::Error::ReadOnly)
        ));
        assert!(matches!(
            store.set_attribute("/", "k", 1i32),
            Err(crate::Error::ReadOnly)
        ));
    }

    #[test]
    fn dataset_keys_are_derived() {
        let store =
            N5Hdf5Store::open_writer(FileContainer::in_memory(), StoreOptions::default()).unwrap();
        let attrs = DatasetAttributes::new(
            vec![5, 6],
            vec![2, 3],
            metadata::DataType::Uint16,
            N5Compression::gzip(),
        )
        .unwrap();
        store.create_dataset("d", &attrs).unwrap();
        assert_eq!(
            store.get_attribute::<Vec<u64>>("d", "dimensions").unwrap(),
            Some(vec![5, 6])
        );
        assert_eq!(
            store.get_attribute_json("d", "compression").unwrap(),
            Some(serde_json::json!({"type": "raw"}))
        );
        assert_eq!(
            store.get_attribute::<metadata::DataType>("d", "dataType").unwrap(),
            Some(metadata::DataType::Uint16)
        );
    }
}
