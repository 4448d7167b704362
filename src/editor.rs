//! Pending member rename/retype side table. Edits accumulate here during a
//! session and are flushed into the pool in one `commit` before save; a
//! rename applies to the member's whole virtual group and to every reference
//! that resolves into that group.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};

use crate::ir::Operand;
use crate::pool::{ClassId, ClassPool};

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
struct MemberKey {
    owner: String,
    name: String,
    descriptor: String,
    method: bool,
}

impl MemberKey {
    fn new(owner: &str, name: &str, descriptor: &str, method: bool) -> Self {
        MemberKey {
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            method,
        }
    }
}

#[derive(Clone, Default)]
struct Edit {
    name: Option<String>,
    descriptor: Option<String>,
}

#[derive(Default)]
pub(crate) struct MemberEditor {
    pending: HashMap<MemberKey, Edit>,
}

struct Plan {
    method: bool,
    old_name: String,
    old_descriptor: String,
    new_name: String,
    new_descriptor: String,
    group: Vec<(ClassId, usize)>,
}

impl MemberEditor {
    pub(crate) fn new() -> Self {
        MemberEditor::default()
    }

    pub(crate) fn rename(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        method: bool,
        new_name: &str,
    ) {
        self.pending
            .entry(MemberKey::new(owner, name, descriptor, method))
            .or_default()
            .name = Some(new_name.to_string());
    }

    pub(crate) fn retype(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        method: bool,
        new_descriptor: &str,
    ) {
        self.pending
            .entry(MemberKey::new(owner, name, descriptor, method))
            .or_default()
            .descriptor = Some(new_descriptor.to_string());
    }

    /// The member's name and descriptor as they will read after commit.
    pub(crate) fn current(
        &self,
        owner: &str,
        name: &str,
        descriptor: &str,
        method: bool,
    ) -> (String, String) {
        match self
            .pending
            .get(&MemberKey::new(owner, name, descriptor, method))
        {
            Some(edit) => (
                edit.name.clone().unwrap_or_else(|| name.to_string()),
                edit.descriptor
                    .clone()
                    .unwrap_or_else(|| descriptor.to_string()),
            ),
            None => (name.to_string(), descriptor.to_string()),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush every pending edit into the pool: the declarations of each
    /// edited member's virtual group and every field/method reference whose
    /// resolution reaches that group. Requires a rebuilt hierarchy.
    pub(crate) fn commit(&mut self, pool: &mut ClassPool) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        // Resolve every group before mutating any declaration; later plans
        // must see pre-edit names.
        let mut plans = Vec::with_capacity(self.pending.len());
        for (key, edit) in &self.pending {
            let owner_id = pool
                .id_of(&key.owner)
                .with_context(|| format!("edited member owner not in pool: {}", key.owner))?;
            let group = if key.method {
                pool.hierarchy()
                    .virtual_methods(pool.slots(), owner_id, &key.name, &key.descriptor)
            } else {
                pool.hierarchy()
                    .virtual_fields(pool.slots(), owner_id, &key.name, &key.descriptor)
            };
            if group.is_empty() {
                anyhow::bail!(
                    "edited member not declared: {}.{} {}",
                    key.owner,
                    key.name,
                    key.descriptor
                );
            }
            plans.push(Plan {
                method: key.method,
                old_name: key.name.clone(),
                old_descriptor: key.descriptor.clone(),
                new_name: edit.name.clone().unwrap_or_else(|| key.name.clone()),
                new_descriptor: edit
                    .descriptor
                    .clone()
                    .unwrap_or_else(|| key.descriptor.clone()),
                group,
            });
        }

        // Reference rewrites, also resolved against the pre-edit pool. A
        // reference owner outside the pool cannot reach a pooled group.
        let mut rewrites: Vec<(ClassId, usize, usize, usize)> = Vec::new();
        let mut reaches: HashMap<(String, usize), bool> = HashMap::new();
        for class_id in 0..pool.slots().len() {
            let Some(class) = pool.get(class_id) else {
                continue;
            };
            for (method_index, method) in class.methods.iter().enumerate() {
                for (insn_index, insn) in method.instructions.iter().enumerate() {
                    let (owner, name, descriptor, is_method) = match &insn.operand {
                        Operand::Field(f) => (&f.owner, &f.name, &f.descriptor, false),
                        Operand::Method(m) => (&m.owner, &m.name, &m.descriptor, true),
                        _ => continue,
                    };
                    for (plan_index, plan) in plans.iter().enumerate() {
                        if plan.method != is_method
                            || *name != plan.old_name
                            || *descriptor != plan.old_descriptor
                        {
                            continue;
                        }
                        let hit = *reaches
                            .entry((owner.clone(), plan_index))
                            .or_insert_with(|| {
                                let Some(owner_id) = pool.id_of(owner) else {
                                    return false;
                                };
                                // The reference owner may only inherit the
                                // member; resolve to the declaring class the
                                // way the JVM would before taking its group.
                                let declaring = if plan.method {
                                    pool.hierarchy().resolve_method(
                                        pool.slots(),
                                        owner_id,
                                        &plan.old_name,
                                        &plan.old_descriptor,
                                    )
                                } else {
                                    pool.hierarchy().resolve_field(
                                        pool.slots(),
                                        owner_id,
                                        &plan.old_name,
                                        &plan.old_descriptor,
                                    )
                                };
                                let Some(declaring) = declaring else {
                                    return false;
                                };
                                let resolved = if plan.method {
                                    pool.hierarchy().virtual_methods(
                                        pool.slots(),
                                        declaring,
                                        &plan.old_name,
                                        &plan.old_descriptor,
                                    )
                                } else {
                                    pool.hierarchy().virtual_fields(
                                        pool.slots(),
                                        declaring,
                                        &plan.old_name,
                                        &plan.old_descriptor,
                                    )
                                };
                                let group: HashSet<_> = plan.group.iter().collect();
                                resolved.iter().any(|m| group.contains(m))
                            });
                        if hit {
                            rewrites.push((class_id, method_index, insn_index, plan_index));
                        }
                    }
                }
            }
        }

        for plan in &plans {
            for &(class_id, member_index) in &plan.group {
                let class = pool.get_mut(class_id).context("group member vanished")?;
                if plan.method {
                    let member = &mut class.methods[member_index];
                    member.name = plan.new_name.clone();
                    member.descriptor = plan.new_descriptor.clone();
                } else {
                    let member = &mut class.fields[member_index];
                    member.name = plan.new_name.clone();
                    member.descriptor = plan.new_descriptor.clone();
                }
            }
        }

        for (class_id, method_index, insn_index, plan_index) in rewrites {
            let plan = &plans[plan_index];
            let class = pool.get_mut(class_id).context("referencing class vanished")?;
            match &mut class.methods[method_index].instructions[insn_index].operand {
                Operand::Field(f) => {
                    f.name = plan.new_name.clone();
                    f.descriptor = plan.new_descriptor.clone();
                }
                Operand::Method(m) => {
                    m.name = plan.new_name.clone();
                    m.descriptor = plan.new_descriptor.clone();
                }
                _ => {}
            }
        }

        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Class, Insn, Method, MethodRef};
    use crate::opcodes::*;

    fn class_of(name: &str, super_name: Option<&str>) -> Class {
        Class {
            name: name.to_string(),
            access: ACC_PUBLIC,
            version: (52, 0),
            super_name: super_name.map(str::to_string),
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    fn concrete(name: &str, descriptor: &str) -> Method {
        Method {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: ACC_PUBLIC,
            instructions: vec![Insn::new(RETURN)],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        }
    }

    #[test]
    fn current_reflects_pending_edits() {
        let mut editor = MemberEditor::new();
        assert_eq!(
            editor.current("a", "run", "()V", true),
            ("run".to_string(), "()V".to_string())
        );
        editor.rename("a", "run", "()V", true, "walk");
        assert_eq!(
            editor.current("a", "run", "()V", true),
            ("walk".to_string(), "()V".to_string())
        );
        assert!(!editor.is_empty());
    }

    #[test]
    fn commit_renames_the_whole_group_and_call_sites() {
        let mut pool = ClassPool::new();
        let mut base = class_of("base", None);
        base.methods.push(concrete("run", "()V"));
        let mut leaf = class_of("leaf", Some("base"));
        leaf.methods.push(concrete("run", "()V"));
        let mut caller = class_of("caller", None);
        caller.methods.push(Method {
            name: "call".to_string(),
            descriptor: "(Lleaf;)V".to_string(),
            access: ACC_PUBLIC | ACC_STATIC,
            instructions: vec![
                Insn::with(ALOAD, crate::ir::Operand::Slot(0)),
                Insn::with(
                    INVOKEVIRTUAL,
                    crate::ir::Operand::Method(MethodRef {
                        owner: "leaf".to_string(),
                        name: "run".to_string(),
                        descriptor: "()V".to_string(),
                        interface: false,
                    }),
                ),
                Insn::new(RETURN),
            ],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        });
        pool.add_class(base);
        pool.add_class(leaf);
        pool.add_class(caller);
        pool.rebuild();

        let mut editor = MemberEditor::new();
        editor.rename("base", "run", "()V", true, "walk");
        editor.commit(&mut pool).expect("commit");
        assert!(editor.is_empty());

        assert!(pool.class("base").expect("base").method("walk", "()V").is_some());
        assert!(pool.class("leaf").expect("leaf").method("walk", "()V").is_some());
        let caller = pool.class("caller").expect("caller");
        match &caller.methods[0].instructions[1].operand {
            Operand::Method(m) => assert_eq!(m.name, "walk"),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn commit_rewrites_references_through_inherited_members() {
        // `leaf` does not redeclare `run`; a call site naming `leaf` as the
        // owner must still follow the rename of `base.run`.
        let mut pool = ClassPool::new();
        let mut base = class_of("base", None);
        base.methods.push(concrete("run", "()V"));
        let leaf = class_of("leaf", Some("base"));
        let mut caller = class_of("caller", None);
        caller.methods.push(Method {
            name: "call".to_string(),
            descriptor: "(Lleaf;)V".to_string(),
            access: ACC_PUBLIC | ACC_STATIC,
            instructions: vec![
                Insn::with(ALOAD, crate::ir::Operand::Slot(0)),
                Insn::with(
                    INVOKEVIRTUAL,
                    crate::ir::Operand::Method(MethodRef {
                        owner: "leaf".to_string(),
                        name: "run".to_string(),
                        descriptor: "()V".to_string(),
                        interface: false,
                    }),
                ),
                Insn::new(RETURN),
            ],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        });
        pool.add_class(base);
        pool.add_class(leaf);
        pool.add_class(caller);
        pool.rebuild();

        let mut editor = MemberEditor::new();
        editor.rename("base", "run", "()V", true, "walk");
        editor.commit(&mut pool).expect("commit");

        assert!(pool.class("base").expect("base").method("walk", "()V").is_some());
        let caller = pool.class("caller").expect("caller");
        match &caller.methods[0].instructions[1].operand {
            Operand::Method(m) => assert_eq!(m.name, "walk"),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn retype_updates_declaration_and_references() {
        let mut pool = ClassPool::new();
        let mut holder = class_of("holder", None);
        holder.fields.push(crate::ir::Field {
            name: "value".to_string(),
            descriptor: "I".to_string(),
            access: ACC_PUBLIC,
            constant_value: None,
        });
        let mut reader = class_of("reader", None);
        reader.methods.push(Method {
            name: "read".to_string(),
            descriptor: "(Lholder;)V".to_string(),
            access: ACC_PUBLIC | ACC_STATIC,
            instructions: vec![
                Insn::with(ALOAD, crate::ir::Operand::Slot(0)),
                Insn::with(
                    GETFIELD,
                    crate::ir::Operand::Field(crate::ir::FieldRef {
                        owner: "holder".to_string(),
                        name: "value".to_string(),
                        descriptor: "I".to_string(),
                    }),
                ),
                Insn::new(POP),
                Insn::new(RETURN),
            ],
            try_catches: Vec::new(),
            exceptions: Vec::new(),
        });
        pool.add_class(holder);
        pool.add_class(reader);
        pool.rebuild();

        let mut editor = MemberEditor::new();
        editor.retype("holder", "value", "I", false, "J");
        assert_eq!(
            editor.current("holder", "value", "I", false),
            ("value".to_string(), "J".to_string())
        );
        editor.commit(&mut pool).expect("commit");

        assert!(pool.class("holder").expect("holder").field("value", "J").is_some());
        let reader = pool.class("reader").expect("reader");
        match &reader.methods[0].instructions[1].operand {
            Operand::Field(f) => assert_eq!(f.descriptor, "J"),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn commit_fails_loudly_for_unknown_members() {
        let mut pool = ClassPool::new();
        pool.add_class(class_of("a", None));
        pool.rebuild();

        let mut editor = MemberEditor::new();
        editor.rename("missing", "run", "()V", true, "walk");
        assert!(editor.commit(&mut pool).is_err());

        let mut editor = MemberEditor::new();
        editor.rename("a", "run", "()V", true, "walk");
        assert!(editor.commit(&mut pool).is_err());
    }
}
