use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use tracing::trace;

use crate::error::{Error, Result};
use crate::header::names::compare_names;
use crate::item::{NefsItem, NefsItemId};

/// A tree position: one primary item and the duplicates sharing its place
#[derive(Debug, Clone)]
struct ItemNode {
    id: NefsItemId,
    parent: Option<usize>,
    /// Child nodes, ordered by their primary id
    children: Vec<usize>,
    /// Later members of the duplicate group, ordered by id
    duplicates: Vec<NefsItemId>,
}

/// All items of an archive arranged as a tree
///
/// Every tree position is an arena node owned by one primary item. Duplicates share the node
/// of their primary, and the id index maps every id, duplicates included, to its node.
#[derive(Debug, Clone, Default)]
pub struct NefsItemList {
    data_file_path: PathBuf,
    items: BTreeMap<NefsItemId, NefsItem>,
    nodes: Vec<ItemNode>,
    node_index: HashMap<NefsItemId, usize>,
    /// Root nodes, ordered by their primary id
    roots: Vec<usize>,
}

impl NefsItemList {
    /// An empty list for the archive stored at `data_file_path`
    pub fn new(data_file_path: impl Into<PathBuf>) -> Self {
        Self {
            data_file_path: data_file_path.into(),
            ..Default::default()
        }
    }

    /// Path of the archive file these items belong to
    pub fn data_file_path(&self) -> &Path {
        &self.data_file_path
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, id: NefsItemId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn get(&self, id: NefsItemId) -> Option<&NefsItem> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: NefsItemId) -> Option<&mut NefsItem> {
        self.items.get_mut(&id)
    }

    /// Adds an item
    ///
    /// A parent must be added before its children and a first duplicate before the later
    /// members of its group. Only directories can be parents and only files can be
    /// duplicated. On error the list is left unchanged.
    pub fn add(&mut self, item: NefsItem) -> Result<()> {
        let id = item.id();
        if self.items.contains_key(&id) {
            return Err(Error::invalid_argument(format!("item {id} was already added")));
        }

        if item.is_duplicate() {
            return self.add_duplicate(item);
        }

        let parent = if item.is_root() {
            None
        } else {
            let parent_id = item.directory_id();
            let parent = self.node_index.get(&parent_id).copied().ok_or_else(|| {
                Error::invalid_argument(format!("parent {parent_id} of item {id} was not added"))
            })?;
            let is_directory = self
                .items
                .get(&self.nodes[parent].id)
                .is_some_and(NefsItem::is_directory);
            if !is_directory {
                return Err(Error::invalid_argument(format!(
                    "parent {parent_id} of item {id} is not a directory"
                )));
            }
            Some(parent)
        };

        let siblings = match parent {
            Some(parent) => &self.nodes[parent].children,
            None => &self.roots,
        };
        let position = siblings.partition_point(|n| self.nodes[*n].id < id);

        let node = self.nodes.len();
        self.nodes.push(ItemNode {
            id,
            parent,
            children: Vec::new(),
            duplicates: Vec::new(),
        });
        match parent {
            Some(parent) => self.nodes[parent].children.insert(position, node),
            None => self.roots.insert(position, node),
        }

        trace!(%id, name = item.file_name(), "item added");
        self.node_index.insert(id, node);
        self.items.insert(id, item);
        Ok(())
    }

    fn add_duplicate(&mut self, item: NefsItem) -> Result<()> {
        let id = item.id();
        let first_id = item.first_duplicate_id();
        let node = self.node_index.get(&first_id).copied().ok_or_else(|| {
            Error::invalid_argument(format!("first duplicate {first_id} of item {id} was not added"))
        })?;

        let primary_is_file = self
            .items
            .get(&self.nodes[node].id)
            .is_some_and(|primary| !primary.is_directory());
        if item.is_directory() || !primary_is_file {
            return Err(Error::invalid_argument(format!(
                "item {id} duplicates {first_id} but only files can be duplicated"
            )));
        }
        if self.nodes[node].id != first_id {
            return Err(Error::invalid_argument(format!(
                "item {id} names duplicate {first_id} as the first of its group"
            )));
        }

        let duplicates = &mut self.nodes[node].duplicates;
        let position = duplicates.partition_point(|d| *d < id);
        duplicates.insert(position, id);

        self.node_index.insert(id, node);
        self.items.insert(id, item);
        Ok(())
    }

    /// All items ordered by id
    pub fn enumerate_by_id(&self) -> impl Iterator<Item = &NefsItem> {
        self.items.values()
    }

    /// Depth first walk visiting siblings by id
    ///
    /// An item is followed by its duplicates and then by its children. This is the entry
    /// table order.
    pub fn enumerate_depth_first_by_id(&self) -> Vec<&NefsItem> {
        let mut output = Vec::with_capacity(self.items.len());
        self.walk(&self.roots, &mut output, &|nodes: &[usize]| nodes.to_vec());
        output
    }

    /// Depth first walk visiting siblings by case insensitive name
    ///
    /// This is the order of the shared-info table.
    pub fn enumerate_depth_first_by_name(&self) -> Vec<&NefsItem> {
        let mut output = Vec::with_capacity(self.items.len());
        self.walk(&self.roots, &mut output, &|nodes: &[usize]| {
            self.sorted_by_name(nodes)
        });
        output
    }

    fn sorted_by_name(&self, nodes: &[usize]) -> Vec<usize> {
        let mut sorted = nodes.to_vec();
        sorted.sort_by(|a, b| {
            let (a, b) = (&self.nodes[*a], &self.nodes[*b]);
            let name_a = self.items.get(&a.id).map_or("", NefsItem::file_name);
            let name_b = self.items.get(&b.id).map_or("", NefsItem::file_name);
            compare_names(name_a, name_b).then(a.id.cmp(&b.id))
        });
        sorted
    }

    fn walk<'a>(
        &'a self,
        nodes: &[usize],
        output: &mut Vec<&'a NefsItem>,
        order: &dyn Fn(&[usize]) -> Vec<usize>,
    ) {
        for index in order(nodes) {
            let node = &self.nodes[index];
            output.extend(
                std::iter::once(&node.id)
                    .chain(&node.duplicates)
                    .filter_map(|id| self.items.get(id)),
            );
            self.walk(&node.children, output, order);
        }
    }

    fn node(&self, id: NefsItemId) -> Result<&ItemNode> {
        self.node_index
            .get(&id)
            .map(|index| &self.nodes[*index])
            .ok_or(Error::ItemNotFound(id))
    }

    /// Primary item of the tree position `id` belongs to
    pub fn get_primary_id(&self, id: NefsItemId) -> Result<NefsItemId> {
        Ok(self.node(id)?.id)
    }

    /// Parent directory id, or `None` for root items
    pub fn get_item_parent_id(&self, id: NefsItemId) -> Result<Option<NefsItemId>> {
        Ok(self.node(id)?.parent.map(|parent| self.nodes[parent].id))
    }

    /// Lowest id child, or `id` itself when it has none
    pub fn get_item_first_child_id(&self, id: NefsItemId) -> Result<NefsItemId> {
        let node = self.node(id)?;
        Ok(node
            .children
            .first()
            .map_or(id, |child| self.nodes[*child].id))
    }

    /// Next higher id item under the same parent, or `id` itself when it is the last
    pub fn get_item_sibling_id(&self, id: NefsItemId) -> Result<NefsItemId> {
        let index = self.node_index.get(&id).copied().ok_or(Error::ItemNotFound(id))?;
        let siblings = match self.nodes[index].parent {
            Some(parent) => &self.nodes[parent].children,
            None => &self.roots,
        };

        Ok(siblings
            .iter()
            .position(|n| *n == index)
            .and_then(|position| siblings.get(position + 1))
            .map_or(id, |next| self.nodes[*next].id))
    }

    /// Path of an item inside the archive, directories joined with `/`
    pub fn get_item_file_path(&self, id: NefsItemId) -> Result<String> {
        let item = self.get(id).ok_or(Error::ItemNotFound(id))?;
        let mut parts = vec![item.file_name()];

        let mut parent = self.node(id)?.parent;
        while let Some(index) = parent {
            let node = &self.nodes[index];
            let name = self
                .items
                .get(&node.id)
                .map(NefsItem::file_name)
                .ok_or(Error::ItemNotFound(node.id))?;
            parts.push(name);
            parent = node.parent;
        }

        parts.reverse();
        Ok(parts.join("/"))
    }

    /// Primary items directly below `id`, by id
    pub fn get_item_children(&self, id: NefsItemId) -> Result<Vec<&NefsItem>> {
        Ok(self
            .node(id)?
            .children
            .iter()
            .filter_map(|child| self.items.get(&self.nodes[*child].id))
            .collect())
    }

    /// Later members of the duplicate group `id` belongs to, by id
    pub fn get_item_duplicates(&self, id: NefsItemId) -> Result<Vec<&NefsItem>> {
        Ok(self
            .node(id)?
            .duplicates
            .iter()
            .filter_map(|duplicate| self.items.get(duplicate))
            .collect())
    }

    /// Root items, by id
    pub fn roots(&self) -> Vec<&NefsItem> {
        self.roots
            .iter()
            .filter_map(|root| self.items.get(&self.nodes[*root].id))
            .collect()
    }
}
