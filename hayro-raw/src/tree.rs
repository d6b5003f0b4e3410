//! Arena bookkeeping shared by the TIFF and CIFF directory trees.
//!
//! Nodes live in a `Vec` and refer to each other by index. Attaching a node checks the
//! nesting limits, so hostile files with deeply nested or very wide directory trees are
//! rejected before any recursion happens.

use crate::error::{FormatError, Result, bail};

/// The maximum depth of a node below the root.
pub(crate) const MAX_DEPTH: u32 = 4;
/// The maximum number of direct children of a node.
pub(crate) const MAX_CHILDREN: u32 = 8;
/// The maximum number of nodes below any node.
pub(crate) const MAX_DESCENDANTS: u32 = 12;

#[derive(Debug, Clone, Default)]
pub(crate) struct Links {
    pub(crate) parent: Option<usize>,
    pub(crate) children: Vec<usize>,
    pub(crate) depth: u32,
    pub(crate) descendants: u32,
}

pub(crate) trait Node {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// Check whether a new child may be attached to `parent`, and return its links.
pub(crate) fn new_child_links<N: Node>(nodes: &[N], parent: usize) -> Result<Links> {
    let parent_links = nodes[parent].links();
    let depth = parent_links.depth + 1;

    if depth > MAX_DEPTH {
        bail!(FormatError::NestingTooDeep { depth });
    }

    let children = parent_links.children.len() as u32 + 1;

    if children > MAX_CHILDREN {
        bail!(FormatError::TooManyChildren { count: children });
    }

    let mut cur = Some(parent);

    while let Some(idx) = cur {
        let links = nodes[idx].links();

        if links.descendants + 1 > MAX_DESCENDANTS {
            bail!(FormatError::TooManyDescendants {
                count: links.descendants + 1,
            });
        }

        cur = links.parent;
    }

    Ok(Links {
        parent: Some(parent),
        children: Vec::new(),
        depth,
        descendants: 0,
    })
}

/// Push `node`, whose links came from [`new_child_links`], and link it to its ancestors.
pub(crate) fn attach<N: Node>(nodes: &mut Vec<N>, node: N) -> usize {
    let idx = nodes.len();
    let mut cur = node.links().parent;
    nodes.push(node);

    if let Some(parent) = cur {
        nodes[parent].links_mut().children.push(idx);
    }

    while let Some(p) = cur {
        let links = nodes[p].links_mut();
        links.descendants += 1;
        cur = links.parent;
    }

    idx
}

/// Remove all nodes starting at index `mark`, undoing their effect on earlier nodes.
///
/// Nodes are attached depth-first, so everything from `mark` on belongs to the subtree
/// that is being discarded.
pub(crate) fn truncate<N: Node>(nodes: &mut Vec<N>, mark: usize) {
    for idx in mark..nodes.len() {
        let mut cur = nodes[idx].links().parent;

        if let Some(parent) = cur
            && parent < mark
        {
            nodes[parent].links_mut().children.retain(|c| *c != idx);
        }

        while let Some(p) = cur {
            let links = nodes[p].links_mut();

            if p < mark {
                links.descendants -= 1;
            }

            cur = links.parent;
        }
    }

    nodes.truncate(mark);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;

    #[derive(Default)]
    struct TestNode(Links);

    impl Node for TestNode {
        fn links(&self) -> &Links {
            &self.0
        }

        fn links_mut(&mut self) -> &mut Links {
            &mut self.0
        }
    }

    fn add(nodes: &mut Vec<TestNode>, parent: usize) -> Result<usize> {
        let links = new_child_links(nodes, parent)?;

        Ok(attach(nodes, TestNode(links)))
    }

    #[test]
    fn depth_limit() {
        let mut nodes = vec![TestNode::default()];
        let mut parent = 0;

        for _ in 0..MAX_DEPTH {
            parent = add(&mut nodes, parent).unwrap();
        }

        assert!(matches!(
            add(&mut nodes, parent),
            Err(DecodeError::Format(FormatError::NestingTooDeep { depth: 5 }))
        ));
    }

    #[test]
    fn children_limit() {
        let mut nodes = vec![TestNode::default()];

        for _ in 0..MAX_CHILDREN {
            add(&mut nodes, 0).unwrap();
        }

        assert!(matches!(
            add(&mut nodes, 0),
            Err(DecodeError::Format(FormatError::TooManyChildren { .. }))
        ));
    }

    #[test]
    fn descendants_limit() {
        let mut nodes = vec![TestNode::default()];
        let a = add(&mut nodes, 0).unwrap();
        let b = add(&mut nodes, 0).unwrap();

        for _ in 0..5 {
            add(&mut nodes, a).unwrap();
            add(&mut nodes, b).unwrap();
        }

        assert_eq!(nodes[0].links().descendants, MAX_DESCENDANTS);
        assert!(matches!(
            add(&mut nodes, a),
            Err(DecodeError::Format(FormatError::TooManyDescendants { .. }))
        ));
    }

    #[test]
    fn truncate_restores_counters() {
        let mut nodes = vec![TestNode::default()];
        let a = add(&mut nodes, 0).unwrap();
        let mark = nodes.len();
        let b = add(&mut nodes, a).unwrap();
        add(&mut nodes, b).unwrap();

        truncate(&mut nodes, mark);

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].links().descendants, 1);
        assert_eq!(nodes[a].links().descendants, 0);
        assert!(nodes[a].links().children.is_empty());
    }
}
