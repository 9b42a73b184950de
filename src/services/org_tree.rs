//! Organization tree arena
//!
//! 组织树以 id 为键的节点表 + 子节点索引表示，按需从存储加载。
//! 重组只在内存中计算完整的层级变更集，校验通过后由存储层一次写入。

use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::organization::{LevelChange, Organization};

#[derive(Debug, Clone, Default)]
pub struct OrgTree {
    nodes: HashMap<Uuid, Organization>,
    children: HashMap<Uuid, Vec<Uuid>>,
}

impl OrgTree {
    /// 由同一租户的组织列表构建
    pub fn build(orgs: Vec<Organization>) -> Self {
        let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut ordered = orgs;
        ordered.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then(a.code.cmp(&b.code)));

        for org in &ordered {
            if let Some(parent_id) = org.parent_id {
                children.entry(parent_id).or_default().push(org.id);
            }
        }

        let nodes = ordered.into_iter().map(|o| (o.id, o)).collect();
        Self { nodes, children }
    }

    pub fn get(&self, id: Uuid) -> Option<&Organization> {
        self.nodes.get(&id)
    }

    pub fn require(&self, id: Uuid) -> Result<&Organization> {
        self.get(id).ok_or_else(|| AppError::not_found("Organization not found"))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn parent(&self, id: Uuid) -> Option<&Organization> {
        self.get(id).and_then(|o| o.parent_id).and_then(|p| self.get(p))
    }

    pub fn children(&self, id: Uuid) -> &[Uuid] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 严格祖先，由近及远
    pub fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut cursor = self.get(id).and_then(|o| o.parent_id);

        while let Some(parent_id) = cursor {
            // 存储层数据损坏时避免死循环
            if !seen.insert(parent_id) {
                tracing::error!(organization_id = %id, "Cycle detected in organization tree");
                break;
            }
            out.push(parent_id);
            cursor = self.get(parent_id).and_then(|o| o.parent_id);
        }
        out
    }

    /// 所在树的根（层级 1）
    pub fn root_of(&self, id: Uuid) -> Uuid {
        self.ancestors(id).last().copied().unwrap_or(id)
    }

    /// 严格后代，广度优先
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        self.descendants_with_depth(id).into_iter().map(|(d, _)| d).collect()
    }

    /// 严格后代及其相对深度（子节点为 1）
    pub fn descendants_with_depth(&self, id: Uuid) -> Vec<(Uuid, i32)> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut queue: VecDeque<(Uuid, i32)> =
            self.children(id).iter().map(|c| (*c, 1)).collect();

        while let Some((node, depth)) = queue.pop_front() {
            if !seen.insert(node) {
                continue;
            }
            out.push((node, depth));
            queue.extend(self.children(node).iter().map(|c| (*c, depth + 1)));
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: Uuid, of: Uuid) -> bool {
        self.ancestors(of).contains(&ancestor)
    }

    /// 祖先到后代的树距离；不是祖先关系时为 None
    pub fn distance(&self, ancestor: Uuid, descendant: Uuid) -> Option<usize> {
        if ancestor == descendant {
            return Some(0);
        }
        self.ancestors(descendant).iter().position(|a| *a == ancestor).map(|p| p + 1)
    }

    /// 计算把 `node_id` 挂到 `new_parent_id` 下、层级设为 `new_level` 所需的全部变更
    ///
    /// 所有结果层级都在 1..=max_level 内才返回变更集，按由浅到深排序；
    /// 任何一项不满足都返回 `StructuralViolation`，不产生部分结果。
    pub fn plan_move(
        &self,
        node_id: Uuid,
        new_parent_id: Option<Uuid>,
        new_level: i32,
        max_level: i32,
    ) -> Result<Vec<LevelChange>> {
        let node = self.require(node_id)?;

        match new_parent_id {
            Some(parent_id) => {
                if parent_id == node_id {
                    return Err(AppError::structural("an organization cannot be its own parent"));
                }
                let parent = self.get(parent_id).ok_or_else(|| {
                    AppError::structural(format!("new parent {} does not exist", parent_id))
                })?;
                if parent.tenant_id != node.tenant_id {
                    return Err(AppError::structural("new parent belongs to another tenant"));
                }
                if !parent.is_active {
                    return Err(AppError::structural("new parent is inactive"));
                }
                if self.is_ancestor(node_id, parent_id) {
                    return Err(AppError::structural(
                        "cannot move an organization beneath its own descendant",
                    ));
                }
                if new_level != parent.level + 1 {
                    return Err(AppError::structural(format!(
                        "level {} does not match parent level {}",
                        new_level, parent.level
                    )));
                }
            }
            None if new_level != 1 => {
                return Err(AppError::structural("a root organization must be at level 1"));
            }
            None => {}
        }

        if new_level < 1 || new_level > max_level {
            return Err(AppError::structural(format!(
                "level {} outside 1..={}",
                new_level, max_level
            )));
        }

        if node.parent_id == new_parent_id && node.level == new_level {
            return Ok(Vec::new());
        }

        let delta = new_level - node.level;
        let mut changes = vec![LevelChange {
            organization_id: node_id,
            parent_id: new_parent_id,
            level: new_level,
        }];

        for (descendant_id, _) in self.descendants_with_depth(node_id) {
            let descendant = self.require(descendant_id)?;
            let level = descendant.level + delta;
            if level < 1 || level > max_level {
                return Err(AppError::structural(format!(
                    "descendant {} would move to level {} (allowed 1..={})",
                    descendant.code, level, max_level
                )));
            }
            changes.push(LevelChange {
                organization_id: descendant_id,
                parent_id: descendant.parent_id,
                level,
            });
        }

        Ok(changes)
    }

    /// 应用变更后的新树（用于重组后的角色继承计算）
    pub fn with_changes(&self, changes: &[LevelChange]) -> Self {
        let mut orgs: Vec<Organization> = self.nodes.values().cloned().collect();
        let by_id: HashMap<Uuid, &LevelChange> =
            changes.iter().map(|c| (c.organization_id, c)).collect();

        for org in &mut orgs {
            if let Some(change) = by_id.get(&org.id) {
                org.parent_id = change.parent_id;
                org.level = change.level;
            }
        }
        Self::build(orgs)
    }

    /// 加入一个新节点
    pub fn with_node(&self, org: Organization) -> Self {
        let mut orgs: Vec<Organization> = self.nodes.values().cloned().collect();
        orgs.push(org);
        Self::build(orgs)
    }

    /// 检查父子层级不变量，返回所有违例节点
    pub fn level_violations(&self) -> Vec<Uuid> {
        let mut bad: Vec<Uuid> = self
            .nodes
            .values()
            .filter(|o| match o.parent_id.and_then(|p| self.get(p)) {
                Some(parent) => parent.level != o.level - 1,
                None => o.parent_id.is_some() || o.level != 1,
            })
            .map(|o| o.id)
            .collect();
        bad.sort();
        bad
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;

    pub(crate) fn org(tenant: Uuid, code: &str, level: i32, parent: Option<Uuid>) -> Organization {
        Organization {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            code: code.to_string(),
            name: code.to_string(),
            level,
            parent_id: parent,
            is_active: true,
            sort_order: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// root -> a -> a1 -> a1x, root -> b
    fn sample() -> (OrgTree, [Uuid; 5]) {
        let tenant = Uuid::new_v4();
        let root = org(tenant, "ROOT", 1, None);
        let a = org(tenant, "A", 2, Some(root.id));
        let b = org(tenant, "B", 2, Some(root.id));
        let a1 = org(tenant, "A1", 3, Some(a.id));
        let a1x = org(tenant, "A1X", 4, Some(a1.id));
        let ids = [root.id, a.id, b.id, a1.id, a1x.id];
        (OrgTree::build(vec![root, a, b, a1, a1x]), ids)
    }

    #[test]
    fn test_ancestors_nearest_first() {
        let (tree, [root, a, _, a1, a1x]) = sample();
        assert_eq!(tree.ancestors(a1x), vec![a1, a, root]);
        assert_eq!(tree.root_of(a1x), root);
        assert_eq!(tree.distance(a, a1x), Some(2));
        assert_eq!(tree.distance(a1x, a), None);
    }

    #[test]
    fn test_descendants_breadth_first() {
        let (tree, [root, a, b, a1, a1x]) = sample();
        let desc = tree.descendants(root);
        assert_eq!(desc.len(), 4);
        assert!(desc.iter().position(|d| *d == a).unwrap() < desc.iter().position(|d| *d == a1).unwrap());
        assert!(desc.contains(&b));
        assert_eq!(tree.descendants(a1x), Vec::<Uuid>::new());
    }

    #[test]
    fn test_move_relevels_whole_subtree() {
        let (tree, [_, _, b, a1, a1x]) = sample();
        // A1 (3) 挂到 B (2) 下保持层级 3
        let changes = tree.plan_move(a1, Some(b), 3, 4).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].parent_id, Some(b));

        let moved = tree.with_changes(&changes);
        assert!(moved.level_violations().is_empty());
        assert_eq!(moved.get(a1x).unwrap().level, 4);
        assert!(moved.is_ancestor(b, a1x));
    }

    #[test]
    fn test_promote_to_root_shifts_descendants_up() {
        let (tree, [_, a, _, a1, a1x]) = sample();
        let changes = tree.plan_move(a, None, 1, 4).unwrap();
        let moved = tree.with_changes(&changes);
        assert_eq!(moved.get(a).unwrap().level, 1);
        assert_eq!(moved.get(a1).unwrap().level, 2);
        assert_eq!(moved.get(a1x).unwrap().level, 3);
        assert!(moved.level_violations().is_empty());
    }

    #[test]
    fn test_move_rejects_depth_overflow() {
        let (tree, [_, a, b, _, _]) = sample();
        // A 的子树深 3 层，挂到 B 下会把 A1X 推到 5 层
        let err = tree.plan_move(a, Some(b), 3, 4).unwrap_err();
        assert!(matches!(err, AppError::StructuralViolation(_)));
    }

    #[test]
    fn test_move_rejects_cycles_and_bad_levels() {
        let (tree, [root, a, _, a1, _]) = sample();
        assert!(matches!(
            tree.plan_move(a, Some(a1), 4, 4),
            Err(AppError::StructuralViolation(_))
        ));
        assert!(matches!(
            tree.plan_move(a, Some(a), 2, 4),
            Err(AppError::StructuralViolation(_))
        ));
        assert!(matches!(
            tree.plan_move(a1, Some(root), 3, 4),
            Err(AppError::StructuralViolation(_))
        ));
        assert!(matches!(
            tree.plan_move(a1, None, 2, 4),
            Err(AppError::StructuralViolation(_))
        ));
    }

    #[test]
    fn test_noop_move_yields_no_changes() {
        let (tree, [root, a, _, _, _]) = sample();
        assert!(tree.plan_move(a, Some(root), 2, 4).unwrap().is_empty());
    }
}
