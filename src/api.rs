//! The N5 store interface.
//!
//! Paths are `/`-separated and relative to the store root; `""` and `"/"` both denote the root.
//! Absent paths and attributes read as `Ok(None)`.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::attributes::{AttributeKind, AttributeValue};
use crate::block::DataBlock;
use crate::metadata::DatasetAttributes;

pub trait N5Reader {
    /// Version stamped on the store root, if any.
    fn version(&self) -> crate::Result<Option<semver::Version>>;

    fn exists(&self, path: &str) -> crate::Result<bool>;

    /// Names of the children of a group.
    fn list(&self, path: &str) -> crate::Result<Vec<String>>;

    fn dataset_exists(&self, path: &str) -> crate::Result<bool>;

    fn get_dataset_attributes(&self, path: &str) -> crate::Result<Option<DatasetAttributes>>;

    /// Read an attribute as `T`. String attributes are returned literally when `T` is a string.
    fn get_attribute<T: DeserializeOwned>(&self, path: &str, key: &str)
    -> crate::Result<Option<T>>;

    /// Read an attribute as JSON. String attributes holding a JSON object or array are parsed.
    fn get_attribute_json(&self, path: &str, key: &str) -> crate::Result<Option<Value>>;

    /// All attributes of a path, including the dataset attributes of datasets.
    fn get_attributes(&self, path: &str) -> crate::Result<Map<String, Value>>;

    fn list_attributes(&self, path: &str) -> crate::Result<BTreeMap<String, AttributeKind>>;

    /// Read the block at `grid_position`; `None` if the dataset does not exist.
    fn read_block(
        &self,
        path: &str,
        attributes: &DatasetAttributes,
        grid_position: &[u64],
    ) -> crate::Result<Option<DataBlock>>;

    /// Release all resources. Further calls fail with [crate::Error::Closed].
    fn close(&self) -> crate::Result<()>;
}

pub trait N5Writer: N5Reader {
    fn create_group(&self, path: &str) -> crate::Result<()>;

    /// Create a dataset, replacing anything at `path`.
    fn create_dataset(&self, path: &str, attributes: &DatasetAttributes) -> crate::Result<()>;

    /// Change the shape of an existing dataset.
    fn set_dataset_attributes(
        &self,
        path: &str,
        attributes: &DatasetAttributes,
    ) -> crate::Result<()>;

    fn set_attribute(
        &self,
        path: &str,
        key: &str,
        value: impl Into<AttributeValue>,
    ) -> crate::Result<()>;

    fn set_attributes(
        &self,
        path: &str,
        attributes: BTreeMap<String, AttributeValue>,
    ) -> crate::Result<()> {
        for (key, value) in attributes {
            self.set_attribute(path, &key, value)?;
        }
        Ok(())
    }

    /// Returns whether the attribute existed.
    fn remove_attribute(&self, path: &str, key: &str) -> crate::Result<bool>;

    /// Returns whether any of the attributes existed.
    fn remove_attributes(&self, path: &str, keys: &[&str]) -> crate::Result<bool> {
        let mut removed = false;
        for key in keys {
            removed |= self.remove_attribute(path, key)?;
        }
        Ok(removed)
    }

    fn write_block(
        &self,
        path: &str,
        attributes: &DatasetAttributes,
        block: &DataBlock,
    ) -> crate::Result<()>;

    /// Delete the block at `grid_position`. Returns whether the dataset exists.
    fn delete_block(&self, path: &str, grid_position: &[u64]) -> crate::Result<bool>;

    /// Remove a group or dataset and everything below it. Returns whether anything was removed.
    fn remove_path(&self, path: &str) -> crate::Result<bool>;

    /// Close the store and delete its backing storage. Returns whether deletion succeeded.
    fn remove(&self) -> crate::Result<bool>;
}
