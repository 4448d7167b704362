//! Class pool: every class of the program under transformation, split into an
//! active partition (rewritten and saved) and an ignored partition (kept for
//! resolution and copied through unchanged).

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use jclassfile::class_file;
use zip::ZipArchive;
use zip::write::SimpleFileOptions;

use crate::codec::{reader, writer};
use crate::hierarchy::Hierarchy;
use crate::ir::Class;

pub(crate) type ClassId = usize;

pub(crate) struct ClassPool {
    // Arena slots; `None` marks a removed class. Ids stay stable across
    // removals so hierarchy side tables can be id-based.
    classes: Vec<Option<Class>>,
    by_name: HashMap<String, ClassId>,
    ignored: HashSet<ClassId>,
    hierarchy: Hierarchy,
    // Set on structural changes; hierarchy queries before the next rebuild
    // are a caller bug.
    dirty: bool,
}

impl ClassPool {
    pub(crate) fn new() -> Self {
        ClassPool {
            classes: Vec::new(),
            by_name: HashMap::new(),
            ignored: HashSet::new(),
            hierarchy: Hierarchy::default(),
            dirty: false,
        }
    }

    /// Insert a class, replacing any existing class of the same name.
    pub(crate) fn add_class(&mut self, class: Class) -> ClassId {
        self.dirty = true;
        if let Some(&id) = self.by_name.get(&class.name) {
            self.classes[id] = Some(class);
            return id;
        }
        let id = self.classes.len();
        self.by_name.insert(class.name.clone(), id);
        self.classes.push(Some(class));
        id
    }

    /// Validate and decode raw class-file bytes, then insert.
    pub(crate) fn add_class_bytes(&mut self, data: &[u8]) -> Result<ClassId> {
        class_file::parse(data).context("failed to parse class file")?;
        let class = reader::read_class(data)?;
        Ok(self.add_class(class))
    }

    pub(crate) fn remove_class(&mut self, name: &str) -> Result<()> {
        let id = self
            .by_name
            .remove(name)
            .with_context(|| format!("class not in pool: {name}"))?;
        self.classes[id] = None;
        self.ignored.remove(&id);
        self.dirty = true;
        Ok(())
    }

    /// Move a class from the active to the ignored partition.
    pub(crate) fn ignore_class(&mut self, name: &str) -> Result<()> {
        let id = self
            .id_of(name)
            .with_context(|| format!("class not in pool: {name}"))?;
        if !self.ignored.insert(id) {
            anyhow::bail!("class already ignored: {name}");
        }
        Ok(())
    }

    pub(crate) fn unignore_class(&mut self, name: &str) -> Result<()> {
        let id = self
            .id_of(name)
            .with_context(|| format!("class not in pool: {name}"))?;
        if !self.ignored.remove(&id) {
            anyhow::bail!("class not ignored: {name}");
        }
        Ok(())
    }

    pub(crate) fn id_of(&self, name: &str) -> Option<ClassId> {
        self.by_name.get(name).copied()
    }

    /// Active-partition lookup.
    pub(crate) fn class(&self, name: &str) -> Option<&Class> {
        let id = self.id_of(name)?;
        if self.ignored.contains(&id) {
            return None;
        }
        self.classes[id].as_ref()
    }

    pub(crate) fn ignored_class(&self, name: &str) -> Option<&Class> {
        let id = self.id_of(name)?;
        if !self.ignored.contains(&id) {
            return None;
        }
        self.classes[id].as_ref()
    }

    /// Lookup across both partitions.
    pub(crate) fn find_class(&self, name: &str) -> Option<&Class> {
        self.classes[self.id_of(name)?].as_ref()
    }

    pub(crate) fn get(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id).and_then(|slot| slot.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        self.classes.get_mut(id).and_then(|slot| slot.as_mut())
    }

    fn sorted_ids(&self, ignored: bool) -> Vec<ClassId> {
        let mut ids: Vec<ClassId> = (0..self.classes.len())
            .filter(|id| self.classes[*id].is_some() && self.ignored.contains(id) == ignored)
            .collect();
        ids.sort_by(|a, b| {
            let name = |id: &ClassId| &self.classes[*id].as_ref().expect("live slot").name;
            name(a).cmp(name(b))
        });
        ids
    }

    /// Active class ids in name order.
    pub(crate) fn active_ids(&self) -> Vec<ClassId> {
        self.sorted_ids(false)
    }

    pub(crate) fn classes(&self) -> impl Iterator<Item = &Class> {
        self.sorted_ids(false)
            .into_iter()
            .map(move |id| self.classes[id].as_ref().expect("live slot"))
    }

    pub(crate) fn ignored_classes(&self) -> impl Iterator<Item = &Class> {
        self.sorted_ids(true)
            .into_iter()
            .map(move |id| self.classes[id].as_ref().expect("live slot"))
    }

    pub(crate) fn len(&self) -> usize {
        self.classes.iter().flatten().count() - self.ignored.len()
    }

    pub(crate) fn ignored_len(&self) -> usize {
        self.ignored.len()
    }

    /// Read every `*.class` entry of a jar into the pool, in sorted entry
    /// order. Returns the number of classes loaded.
    pub(crate) fn load_jar(&mut self, path: &Path) -> Result<usize> {
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut archive =
            ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;

        let mut entry_names = Vec::new();
        for index in 0..archive.len() {
            let entry = archive
                .by_index(index)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if !entry.is_dir() && entry.name().ends_with(".class") {
                entry_names.push(entry.name().to_string());
            }
        }
        entry_names.sort();

        let mut count = 0;
        for name in entry_names {
            let mut entry = archive
                .by_name(&name)
                .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
            self.add_class_bytes(&data)
                .with_context(|| format!("failed to load {}:{}", path.display(), name))?;
            count += 1;
        }
        Ok(count)
    }

    /// Write every retained class, active and ignored, as `<name>.class`.
    pub(crate) fn save_to_jar(&self, path: &Path) -> Result<()> {
        let file =
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        let mut jar = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        for id in self.sorted_ids(false).into_iter().chain(self.sorted_ids(true)) {
            let class = self.classes[id].as_ref().expect("live slot");
            let data = writer::write_class(class)
                .with_context(|| format!("failed to encode {}", class.name))?;
            jar.start_file(format!("{}.class", class.name), options)
                .with_context(|| format!("failed to write {}", path.display()))?;
            jar.write_all(&data)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }
        jar.finish()
            .with_context(|| format!("failed to finish {}", path.display()))?;
        Ok(())
    }

    /// Re-derive all hierarchy links from the current pool contents.
    pub(crate) fn rebuild(&mut self) {
        self.hierarchy.rebuild(&self.classes, &self.by_name);
        self.dirty = false;
    }

    pub(crate) fn hierarchy(&self) -> &Hierarchy {
        debug_assert!(!self.dirty, "hierarchy queried before rebuild");
        &self.hierarchy
    }

    /// Arena view for hierarchy queries.
    pub(crate) fn slots(&self) -> &[Option<Class>] {
        &self.classes
    }

    pub(crate) fn clear(&mut self) {
        self.classes.clear();
        self.by_name.clear();
        self.ignored.clear();
        self.hierarchy = Hierarchy::default();
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Field, Insn, Method, Operand};
    use crate::opcodes::*;

    fn class_of(name: &str) -> Class {
        Class {
            name: name.to_string(),
            access: ACC_PUBLIC,
            version: (52, 0),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    #[test]
    fn ignore_moves_between_partitions() {
        let mut pool = ClassPool::new();
        pool.add_class(class_of("a"));
        pool.add_class(class_of("b"));

        pool.ignore_class("a").expect("ignore");
        assert!(pool.class("a").is_none());
        assert!(pool.ignored_class("a").is_some());
        assert!(pool.find_class("a").is_some());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.ignored_len(), 1);

        assert!(pool.ignore_class("a").is_err());
        assert!(pool.unignore_class("b").is_err());

        pool.unignore_class("a").expect("unignore");
        assert!(pool.class("a").is_some());
    }

    #[test]
    fn duplicate_name_replaces_in_place() {
        let mut pool = ClassPool::new();
        let first = pool.add_class(class_of("a"));
        let mut replacement = class_of("a");
        replacement.access |= ACC_FINAL;
        let second = pool.add_class(replacement);
        assert_eq!(first, second);
        assert_ne!(pool.class("a").expect("present").access & ACC_FINAL, 0);
    }

    #[test]
    fn remove_purges_the_class() {
        let mut pool = ClassPool::new();
        pool.add_class(class_of("a"));
        pool.ignore_class("a").expect("ignore");
        pool.remove_class("a").expect("remove");
        assert!(pool.find_class("a").is_none());
        assert_eq!(pool.ignored_len(), 0);
        assert!(pool.remove_class("a").is_err());
    }

    #[test]
    fn iteration_is_name_sorted() {
        let mut pool = ClassPool::new();
        pool.add_class(class_of("b"));
        pool.add_class(class_of("a"));
        pool.add_class(class_of("c"));
        let names: Vec<&str> = pool.classes().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn clear_empties_both_partitions() {
        let mut pool = ClassPool::new();
        pool.add_class(class_of("a"));
        pool.add_class(class_of("b"));
        pool.ignore_class("b").expect("ignore");
        pool.rebuild();

        let ignored: Vec<&str> = pool.ignored_classes().map(|c| c.name.as_str()).collect();
        assert_eq!(ignored, vec!["b"]);

        pool.clear();
        assert_eq!(pool.len(), 0);
        assert_eq!(pool.ignored_len(), 0);
        assert!(pool.find_class("a").is_none());
    }

    #[test]
    fn jar_round_trip_preserves_classes() {
        let mut class = class_of("pkg/Sample");
        class.fields.push(Field {
            name: "counter".to_string(),
            descriptor: "I".to_string(),
            access: ACC_PRIVATE,
            constant_value: None,
        });
        class.methods.push(Method {
            name: "run".to_string(),
            descriptor: "()I".to_string(),
            access: ACC_PUBLIC | ACC_STATIC,
            instructions: vec![
                Insn::with(ICONST_0, Operand::Int(0)),
                Insn::new(IRETURN),
            ],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        });

        let mut pool = ClassPool::new();
        pool.add_class(class);
        pool.add_class(class_of("pkg/Other"));
        pool.ignore_class("pkg/Other").expect("ignore");

        let dir = tempfile::tempdir().expect("temp dir");
        let jar = dir.path().join("out.jar");
        pool.save_to_jar(&jar).expect("save");

        let mut reloaded = ClassPool::new();
        let count = reloaded.load_jar(&jar).expect("load");
        assert_eq!(count, 2);

        let sample = reloaded.class("pkg/Sample").expect("sample");
        assert_eq!(sample.fields.len(), 1);
        let run = sample.method("run", "()I").expect("method");
        assert_eq!(run.instructions.len(), 2);
        assert_eq!(run.instructions[1].opcode, IRETURN);
        assert!(reloaded.class("pkg/Other").is_some());
    }
}
