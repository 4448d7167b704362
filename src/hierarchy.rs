//! Inheritance links between pooled classes and virtual-dispatch group
//! resolution. Links are id-based side tables rebuilt from scratch by
//! [`Hierarchy::rebuild`]; a superclass or interface name that is not in the
//! pool simply contributes no edge.

use std::collections::{HashMap, HashSet};

use crate::ir::Class;
use crate::pool::ClassId;

#[derive(Default)]
pub(crate) struct Hierarchy {
    super_class: Vec<Option<ClassId>>,
    interfaces: Vec<Vec<ClassId>>,
    children: Vec<Vec<ClassId>>,
    implementers: Vec<Vec<ClassId>>,
}

impl Hierarchy {
    /// Re-derive every link from the current pool contents. `children` and
    /// `implementers` are kept as the exact inverses of `super_class` and
    /// `interfaces`.
    pub(crate) fn rebuild(
        &mut self,
        classes: &[Option<Class>],
        index: &HashMap<String, ClassId>,
    ) {
        let count = classes.len();
        self.super_class = vec![None; count];
        self.interfaces = vec![Vec::new(); count];
        self.children = vec![Vec::new(); count];
        self.implementers = vec![Vec::new(); count];

        for (id, slot) in classes.iter().enumerate() {
            let Some(class) = slot else { continue };
            if let Some(super_id) = class
                .super_name
                .as_ref()
                .and_then(|name| index.get(name))
                .copied()
                .filter(|&s| classes[s].is_some())
            {
                self.super_class[id] = Some(super_id);
                self.children[super_id].push(id);
            }
            for interface_id in class
                .interfaces
                .iter()
                .filter_map(|name| index.get(name))
                .copied()
                .filter(|&i| classes[i].is_some())
            {
                self.interfaces[id].push(interface_id);
                self.implementers[interface_id].push(id);
            }
        }
    }

    pub(crate) fn super_class(&self, id: ClassId) -> Option<ClassId> {
        self.super_class[id]
    }

    pub(crate) fn interfaces(&self, id: ClassId) -> &[ClassId] {
        &self.interfaces[id]
    }

    pub(crate) fn children(&self, id: ClassId) -> &[ClassId] {
        &self.children[id]
    }

    pub(crate) fn implementers(&self, id: ClassId) -> &[ClassId] {
        &self.implementers[id]
    }

    /// Upward closure including `start` itself.
    fn ancestors(&self, start: ClassId, with_interfaces: bool) -> HashSet<ClassId> {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(super_id) = self.super_class[id] {
                stack.push(super_id);
            }
            if with_interfaces {
                stack.extend(self.interfaces[id].iter().copied());
            }
        }
        visited
    }

    /// Nearest class in the upward closure of `id` declaring the method,
    /// by JVM resolution order: the class itself, then the superclass
    /// chain, then the transitive interfaces of every class on that chain.
    pub(crate) fn resolve_method(
        &self,
        classes: &[Option<Class>],
        id: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Option<ClassId> {
        self.resolve(classes, id, name, descriptor, true)
    }

    /// Field analog of [`resolve_method`]; superclass chain only.
    pub(crate) fn resolve_field(
        &self,
        classes: &[Option<Class>],
        id: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Option<ClassId> {
        self.resolve(classes, id, name, descriptor, false)
    }

    fn resolve(
        &self,
        classes: &[Option<Class>],
        id: ClassId,
        name: &str,
        descriptor: &str,
        methods: bool,
    ) -> Option<ClassId> {
        let mut chain = Vec::new();
        let mut current = Some(id);
        while let Some(c) = current {
            if declaration(classes, c, name, descriptor, methods).is_some() {
                return Some(c);
            }
            chain.push(c);
            current = self.super_class[c];
        }
        if !methods {
            return None;
        }
        let mut visited = HashSet::new();
        let mut stack: Vec<ClassId> = chain
            .iter()
            .flat_map(|&c| self.interfaces[c].iter().copied())
            .collect();
        while let Some(c) = stack.pop() {
            if !visited.insert(c) {
                continue;
            }
            if declaration(classes, c, name, descriptor, methods).is_some() {
                return Some(c);
            }
            stack.extend(self.interfaces[c].iter().copied());
        }
        None
    }

    /// All method declarations sharing one dispatch slot with
    /// `(id, name, descriptor)`, as `(class id, method index)` pairs in id
    /// order. Empty when `id` has no such declaration.
    pub(crate) fn virtual_methods(
        &self,
        classes: &[Option<Class>],
        id: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Vec<(ClassId, usize)> {
        self.virtual_group(classes, id, name, descriptor, true)
    }

    /// Field analog of [`virtual_methods`]; only the superclass chain is
    /// walked (interface fields are constants and never dispatch).
    pub(crate) fn virtual_fields(
        &self,
        classes: &[Option<Class>],
        id: ClassId,
        name: &str,
        descriptor: &str,
    ) -> Vec<(ClassId, usize)> {
        self.virtual_group(classes, id, name, descriptor, false)
    }

    fn virtual_group(
        &self,
        classes: &[Option<Class>],
        id: ClassId,
        name: &str,
        descriptor: &str,
        methods: bool,
    ) -> Vec<(ClassId, usize)> {
        let Some((start_index, is_static)) = declaration(classes, id, name, descriptor, methods)
        else {
            return Vec::new();
        };
        // Statics never participate in dispatch.
        if is_static {
            return vec![(id, start_index)];
        }
        let declares = |c: ClassId| -> Option<usize> {
            declaration(classes, c, name, descriptor, methods)
                .filter(|(_, is_static)| !is_static)
                .map(|(i, _)| i)
        };

        // Base declarations: ancestors declaring the member with no declaring
        // ancestor of their own. A declaration anywhere above the starting
        // class supersedes the starting class's own.
        let ancestors = self.ancestors(id, methods);
        let declaring: HashSet<ClassId> = ancestors
            .iter()
            .copied()
            .filter(|&c| declares(c).is_some())
            .collect();
        let bases: Vec<ClassId> = declaring
            .iter()
            .copied()
            .filter(|&d| {
                !self
                    .ancestors(d, methods)
                    .iter()
                    .any(|&a| a != d && declaring.contains(&a))
            })
            .collect();

        // Flood down from every base, collecting matching declarations.
        let mut group = Vec::new();
        let mut visited = HashSet::new();
        let mut stack = bases;
        while let Some(c) = stack.pop() {
            if !visited.insert(c) {
                continue;
            }
            if let Some(index) = declares(c) {
                group.push((c, index));
            }
            stack.extend(self.children[c].iter().copied());
            if methods {
                stack.extend(self.implementers[c].iter().copied());
            }
        }
        group.sort_unstable();
        group
    }
}

/// Index and staticness of the member declared directly on `c`, if any.
fn declaration(
    classes: &[Option<Class>],
    c: ClassId,
    name: &str,
    descriptor: &str,
    methods: bool,
) -> Option<(usize, bool)> {
    let class = classes[c].as_ref()?;
    if methods {
        class
            .methods
            .iter()
            .position(|m| m.name == name && m.descriptor == descriptor)
            .map(|i| (i, class.methods[i].is_static()))
    } else {
        class
            .fields
            .iter()
            .position(|f| f.name == name && f.descriptor == descriptor)
            .map(|i| (i, class.fields[i].is_static()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Field, Method};
    use crate::opcodes::*;
    use crate::pool::ClassPool;

    fn class(name: &str, super_name: Option<&str>, interfaces: &[&str], access: u16) -> Class {
        Class {
            name: name.to_string(),
            access,
            version: (52, 0),
            super_name: super_name.map(str::to_string),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    fn method(name: &str, descriptor: &str, access: u16) -> Method {
        Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            instructions: Vec::new(),
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    fn field(name: &str, descriptor: &str, access: u16) -> Field {
        Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access,
            constant_value: None,
        }
    }

    fn names(pool: &ClassPool, group: &[(ClassId, usize)]) -> Vec<String> {
        let mut out: Vec<String> = group
            .iter()
            .map(|(id, _)| pool.get(*id).expect("live").name.clone())
            .collect();
        out.sort();
        out
    }

    #[test]
    fn links_are_mutual_inverses() {
        let mut pool = ClassPool::new();
        pool.add_class(class("a", None, &[], ACC_PUBLIC));
        pool.add_class(class("i", None, &[], ACC_PUBLIC | ACC_INTERFACE));
        pool.add_class(class("b", Some("a"), &["i"], ACC_PUBLIC));
        pool.rebuild();

        let h = pool.hierarchy();
        let a = pool.id_of("a").expect("a");
        let b = pool.id_of("b").expect("b");
        let i = pool.id_of("i").expect("i");
        assert_eq!(h.super_class(b), Some(a));
        assert_eq!(h.children(a), &[b]);
        assert_eq!(h.interfaces(b), &[i]);
        assert_eq!(h.implementers(i), &[b]);
        assert_eq!(h.super_class(a), None);
    }

    #[test]
    fn absent_super_name_leaves_no_edge() {
        let mut pool = ClassPool::new();
        pool.add_class(class("a", Some("java/lang/Object"), &[], ACC_PUBLIC));
        pool.rebuild();
        let a = pool.id_of("a").expect("a");
        assert_eq!(pool.hierarchy().super_class(a), None);
    }

    #[test]
    fn override_chain_forms_one_group() {
        let mut pool = ClassPool::new();
        let mut base = class("base", None, &[], ACC_PUBLIC);
        base.methods.push(method("run", "()V", ACC_PUBLIC));
        let mid = class("mid", Some("base"), &[], ACC_PUBLIC);
        let mut leaf = class("leaf", Some("mid"), &[], ACC_PUBLIC);
        leaf.methods.push(method("run", "()V", ACC_PUBLIC));
        pool.add_class(base);
        pool.add_class(mid);
        pool.add_class(leaf);
        pool.rebuild();

        // The group is the same whether resolved from the base or the
        // overriding leaf declaration.
        for start in ["base", "leaf"] {
            let id = pool.id_of(start).expect("id");
            let group = pool
                .hierarchy()
                .virtual_methods(pool.slots(), id, "run", "()V");
            assert_eq!(names(&pool, &group), vec!["base", "leaf"]);
        }
    }

    #[test]
    fn interface_diamond_is_visited_once() {
        let mut pool = ClassPool::new();
        let mut root = class("root", None, &[], ACC_PUBLIC | ACC_INTERFACE);
        root.methods.push(method("run", "()V", ACC_PUBLIC | ACC_ABSTRACT));
        let left = class("left", None, &["root"], ACC_PUBLIC | ACC_INTERFACE);
        let right = class("right", None, &["root"], ACC_PUBLIC | ACC_INTERFACE);
        let mut both = class("both", None, &["left", "right"], ACC_PUBLIC);
        both.methods.push(method("run", "()V", ACC_PUBLIC));
        pool.add_class(root);
        pool.add_class(left);
        pool.add_class(right);
        pool.add_class(both);
        pool.rebuild();

        let id = pool.id_of("both").expect("id");
        let group = pool
            .hierarchy()
            .virtual_methods(pool.slots(), id, "run", "()V");
        assert_eq!(names(&pool, &group), vec!["both", "root"]);
    }

    #[test]
    fn sibling_declarations_under_one_base_share_the_group() {
        let mut pool = ClassPool::new();
        let mut base = class("base", None, &[], ACC_PUBLIC);
        base.methods.push(method("run", "()V", ACC_PUBLIC));
        let mut one = class("one", Some("base"), &[], ACC_PUBLIC);
        one.methods.push(method("run", "()V", ACC_PUBLIC));
        let mut two = class("two", Some("base"), &[], ACC_PUBLIC);
        two.methods.push(method("run", "()V", ACC_PUBLIC));
        pool.add_class(base);
        pool.add_class(one);
        pool.add_class(two);
        pool.rebuild();

        let id = pool.id_of("one").expect("id");
        let group = pool
            .hierarchy()
            .virtual_methods(pool.slots(), id, "run", "()V");
        assert_eq!(names(&pool, &group), vec!["base", "one", "two"]);
    }

    #[test]
    fn unrelated_declarations_stay_separate() {
        let mut pool = ClassPool::new();
        let mut a = class("a", None, &[], ACC_PUBLIC);
        a.methods.push(method("run", "()V", ACC_PUBLIC));
        let mut b = class("b", None, &[], ACC_PUBLIC);
        b.methods.push(method("run", "()V", ACC_PUBLIC));
        pool.add_class(a);
        pool.add_class(b);
        pool.rebuild();

        let id = pool.id_of("a").expect("id");
        let group = pool
            .hierarchy()
            .virtual_methods(pool.slots(), id, "run", "()V");
        assert_eq!(names(&pool, &group), vec!["a"]);
    }

    #[test]
    fn resolution_walks_up_to_the_declaring_class() {
        let mut pool = ClassPool::new();
        let mut base = class("base", None, &[], ACC_PUBLIC);
        base.methods.push(method("run", "()V", ACC_PUBLIC));
        base.fields.push(field("value", "I", ACC_PUBLIC));
        pool.add_class(base);
        pool.add_class(class("mid", Some("base"), &[], ACC_PUBLIC));
        pool.add_class(class("leaf", Some("mid"), &[], ACC_PUBLIC));
        pool.rebuild();

        let h = pool.hierarchy();
        let base_id = pool.id_of("base").expect("base");
        let leaf_id = pool.id_of("leaf").expect("leaf");
        assert_eq!(
            h.resolve_method(pool.slots(), leaf_id, "run", "()V"),
            Some(base_id)
        );
        assert_eq!(
            h.resolve_field(pool.slots(), leaf_id, "value", "I"),
            Some(base_id)
        );
        assert_eq!(h.resolve_method(pool.slots(), leaf_id, "gone", "()V"), None);
    }

    #[test]
    fn resolution_reaches_interface_declarations() {
        let mut pool = ClassPool::new();
        let mut root = class("root", None, &[], ACC_PUBLIC | ACC_INTERFACE);
        root.methods.push(method("run", "()V", ACC_PUBLIC | ACC_ABSTRACT));
        pool.add_class(root);
        pool.add_class(class("mid", None, &["root"], ACC_PUBLIC | ACC_INTERFACE));
        pool.add_class(class("impl", None, &["mid"], ACC_PUBLIC));
        pool.rebuild();

        let h = pool.hierarchy();
        let root_id = pool.id_of("root").expect("root");
        let impl_id = pool.id_of("impl").expect("impl");
        assert_eq!(
            h.resolve_method(pool.slots(), impl_id, "run", "()V"),
            Some(root_id)
        );
        // Field resolution never crosses interface edges.
        assert_eq!(h.resolve_field(pool.slots(), impl_id, "run", "()V"), None);
    }

    #[test]
    fn static_members_are_singletons() {
        let mut pool = ClassPool::new();
        let mut base = class("base", None, &[], ACC_PUBLIC);
        base.methods
            .push(method("run", "()V", ACC_PUBLIC | ACC_STATIC));
        let mut leaf = class("leaf", Some("base"), &[], ACC_PUBLIC);
        leaf.methods
            .push(method("run", "()V", ACC_PUBLIC | ACC_STATIC));
        pool.add_class(base);
        pool.add_class(leaf);
        pool.rebuild();

        let id = pool.id_of("leaf").expect("id");
        let group = pool
            .hierarchy()
            .virtual_methods(pool.slots(), id, "run", "()V");
        assert_eq!(names(&pool, &group), vec!["leaf"]);
    }

    #[test]
    fn field_groups_walk_the_superclass_chain() {
        let mut pool = ClassPool::new();
        let mut base = class("base", None, &[], ACC_PUBLIC);
        base.fields.push(field("value", "I", ACC_PUBLIC));
        let mut leaf = class("leaf", Some("base"), &[], ACC_PUBLIC);
        leaf.fields.push(field("value", "I", ACC_PUBLIC));
        pool.add_class(base);
        pool.add_class(leaf);
        pool.rebuild();

        let id = pool.id_of("leaf").expect("id");
        let group = pool
            .hierarchy()
            .virtual_fields(pool.slots(), id, "value", "I");
        assert_eq!(names(&pool, &group), vec!["base", "leaf"]);

        // A static field with the same name in the chain stays out.
        let mut pool = ClassPool::new();
        let mut base = class("base", None, &[], ACC_PUBLIC);
        base.fields.push(field("value", "I", ACC_PUBLIC | ACC_STATIC));
        let mut leaf = class("leaf", Some("base"), &[], ACC_PUBLIC);
        leaf.fields.push(field("value", "I", ACC_PUBLIC));
        pool.add_class(base);
        pool.add_class(leaf);
        pool.rebuild();
        let id = pool.id_of("leaf").expect("id");
        let group = pool
            .hierarchy()
            .virtual_fields(pool.slots(), id, "value", "I");
        assert_eq!(names(&pool, &group), vec!["leaf"]);
    }
}
