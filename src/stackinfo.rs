// Compiler-emitted metadata describing which typed variables live on
// a function's stack frame at every instruction boundary. The
// garbage collector walks this to find the exact set of live
// pointers, so the information here has to be bit-accurate.
//
// The tree is stored as an arena of nodes addressed by index; nodes
// point at their parent and previous sibling, which is the order the
// walker needs (newest binding first, then outward through the
// enclosing scopes).

use crate::datatype::Datatype;


#[derive(Clone, Debug, PartialEq)]
pub struct VariableEntry {
    pub name: String,
    pub datatype: Datatype,
}


#[derive(Clone, Debug)]
pub(crate) struct Node {
    // First instruction at which this node is in effect.
    pub(crate) start_ip: i32,
    // One past the last instruction for scopes; MAX while open.
    pub(crate) end_ip: i32,
    // Frame size in bytes just after the binding was pushed.
    pub(crate) stack_size: i32,
    pub(crate) is_scope: bool,
    // Crossing a pop marker hides this node's older siblings: their
    // values have been physically popped.
    pub(crate) at_pop: bool,
    pub(crate) variable: Option<VariableEntry>,
    pub(crate) parent: Option<usize>,
    pub(crate) prev_sibling: Option<usize>,
    pub(crate) children: Vec<usize>,
}


#[derive(Clone, Debug)]
pub struct StackInformation {
    nodes: Vec<Node>,
    // Construction cursor: the chain of open scopes.
    open: Vec<usize>,
}


impl StackInformation {
    pub fn new(entry_ip: i32, initial_stack_size: i32) -> StackInformation {
        let root = Node {
            start_ip: entry_ip,
            end_ip: i32::max_value(),
            stack_size: initial_stack_size,
            is_scope: true,
            at_pop: false,
            variable: None,
            parent: None,
            prev_sibling: None,
            children: Vec::new(),
        };
        StackInformation { nodes: vec![root], open: vec![0] }
    }

    fn current_scope(&self) -> usize {
        *self.open.last().expect("no open scope")
    }

    fn attach(&mut self, mut node: Node) -> usize {
        let parent = self.current_scope();
        node.parent = Some(parent);
        node.prev_sibling = self.nodes[parent].children.last().copied();
        let index = self.nodes.len();
        self.nodes.push(node);
        self.nodes[parent].children.push(index);
        index
    }

    pub fn begin_scope(&mut self, ip: i32, stack_size: i32) {
        let index = self.attach(Node {
            start_ip: ip,
            end_ip: i32::max_value(),
            stack_size,
            is_scope: true,
            at_pop: false,
            variable: None,
            parent: None,
            prev_sibling: None,
            children: Vec::new(),
        });
        self.open.push(index);
    }

    pub fn end_scope(&mut self, end_ip: i32) {
        assert!(self.open.len() > 1, "no scope to end");
        let index = self.open.pop().expect("no scope to end");
        self.nodes[index].end_ip = end_ip;
    }

    pub fn add_variable(
        &mut self,
        ip: i32,
        stack_size: i32,
        name: &str,
        datatype: Datatype,
    ) {
        self.attach(Node {
            start_ip: ip,
            end_ip: ip,
            stack_size,
            is_scope: false,
            at_pop: false,
            variable: Some(VariableEntry {
                name: name.to_string(),
                datatype,
            }),
            parent: None,
            prev_sibling: None,
            children: Vec::new(),
        });
    }

    pub fn add_pop_marker(&mut self, ip: i32, stack_size: i32) {
        self.attach(Node {
            start_ip: ip,
            end_ip: ip,
            stack_size,
            is_scope: false,
            at_pop: true,
            variable: None,
            parent: None,
            prev_sibling: None,
            children: Vec::new(),
        });
    }

    // Close everything that is still open; called once when the
    // function's code is complete.
    pub fn finish(&mut self, end_ip: i32) {
        while self.open.len() > 1 {
            self.end_scope(end_ip);
        }
        self.nodes[0].end_ip = end_ip;
        self.open.clear();
    }

    // The deepest node in effect at `ip`: descend into the youngest
    // scope that still covers the target, and stop at the youngest
    // leaf otherwise.
    pub(crate) fn best_node_for_ip(&self, ip: i32) -> Option<usize> {
        if ip < self.nodes[0].start_ip || ip >= self.nodes[0].end_ip {
            return None;
        }
        let mut current = 0;
        loop {
            let candidate = self.nodes[current]
                .children
                .iter()
                .copied()
                .filter(|&c| {
                    let node = &self.nodes[c];
                    node.start_ip <= ip
                        && (!node.is_scope || node.end_ip > ip)
                })
                .last();
            match candidate {
                Some(c) if self.nodes[c].is_scope => current = c,
                Some(c) => return Some(c),
                None => return Some(current),
            }
        }
    }

    pub(crate) fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    // Walk the tree the way the VM does and collect the visible
    // variable names, oldest last.
    fn visible(info: &StackInformation, ip: i32) -> Vec<String> {
        let mut names = Vec::new();
        let mut node = info.best_node_for_ip(ip);
        let mut after_pop = false;
        while let Some(index) = node {
            let n = info.node(index);
            if n.at_pop {
                after_pop = true;
            }
            if let Some(var) = &n.variable {
                if !after_pop {
                    names.push(var.name.clone());
                }
            }
            node = match n.prev_sibling {
                Some(prev) => Some(prev),
                None => {
                    after_pop = false;
                    n.parent
                }
            };
        }
        names
    }

    fn sample() -> StackInformation {
        // fn f() {        // entry at ip 0
        //   let a = ...;  // ip 4, frame 8
        //   {             // scope [10, 30)
        //     let b = ...;// ip 14, frame 16
        //   }
        //   let c = ...;  // ip 34, frame 16
        // }
        let mut info = StackInformation::new(0, 0);
        info.add_variable(4, 8, "a", Datatype::I64);
        info.begin_scope(10, 8);
        info.add_variable(14, 16, "b", Datatype::I64);
        info.end_scope(30);
        info.add_variable(34, 16, "c", Datatype::I64);
        info.finish(40);
        info
    }

    #[test]
    fn inner_scope_sees_outer_variables() {
        let info = sample();
        assert_eq!(visible(&info, 20), vec!["b", "a"]);
    }

    #[test]
    fn closed_scope_variables_disappear() {
        assert_eq!(visible(&sample(), 32), vec!["a"]);
    }

    #[test]
    fn later_bindings_appear_in_order() {
        assert_eq!(visible(&sample(), 36), vec!["c", "a"]);
    }

    #[test]
    fn before_first_binding_nothing_is_visible() {
        assert_eq!(visible(&sample(), 2), Vec::<String>::new());
    }

    #[test]
    fn out_of_range_ips_have_no_node() {
        assert_eq!(sample().best_node_for_ip(40), None);
        assert_eq!(sample().best_node_for_ip(-1), None);
    }

    #[test]
    fn pop_marker_hides_older_siblings_only() {
        // a and b bound, then both popped mid-scope, then c bound.
        let mut info = StackInformation::new(0, 0);
        info.add_variable(2, 8, "a", Datatype::I64);
        info.add_variable(4, 16, "b", Datatype::I64);
        info.add_pop_marker(6, 0);
        info.add_variable(8, 8, "c", Datatype::I64);
        info.finish(20);
        assert_eq!(visible(&info, 3), vec!["a"]);
        assert_eq!(visible(&info, 5), vec!["b", "a"]);
        assert_eq!(visible(&info, 7), Vec::<String>::new());
        assert_eq!(visible(&info, 9), vec!["c"]);
    }

    #[test]
    fn pop_marker_in_inner_scope_spares_the_outer_scope() {
        let mut info = StackInformation::new(0, 0);
        info.add_variable(2, 8, "outer", Datatype::I64);
        info.begin_scope(4, 8);
        info.add_variable(6, 16, "inner", Datatype::I64);
        info.add_pop_marker(8, 8);
        info.end_scope(12);
        info.finish(20);
        // Crossing the marker hides "inner" but the suppression
        // resets when the walk ascends to the parent scope.
        assert_eq!(visible(&info, 10), vec!["outer"]);
    }
}
