use std::collections::HashSet;

use smallvec::*;

use super::*;

/// How aggressively nodes are fused into kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FusionMode {
    /// fewest kernels the materialization rules allow
    #[default]
    Max,
    /// one kernel per computed node, literals stay inlined
    None,
}

impl FusionMode {
    pub fn name(&self) -> &'static str {
        match self { FusionMode::Max => "max", FusionMode::None => "none" }
    }
    pub fn parse(s: &str) -> Option<FusionMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Some(FusionMode::Max),
            "none" => Some(FusionMode::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Main,
    // accumulation loop of the reduction
    Inner(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Edge {
    // read at the consumer's own iteration point
    Elem,
    // read by a loop body nested below the producer
    Outside,
    // source of an indexed load
    Gather,
    // target of an indexed write
    Target,
    // carried into, out of, or bounding a loop
    Carry,
}

// a kernel under construction
struct Draft {
    region: Option<LoopId>,
    domain: Shape,
    main: Vec<NodeId>,
    inner: Vec<(NodeId, Vec<NodeId>)>,
    // materialized node and the writes landing in its buffer
    outputs: Vec<(NodeId, Vec<NodeId>)>,
    alive: bool,
}

struct Planner<'g> {
    graph: &'g Graph,
    fuse: bool,
    users: Vec<Vec<(NodeId, Edge)>>,
    // successors along data and loop edges
    fwd: Vec<SmallVec<[NodeId; 4]>>,
    is_output: Vec<bool>,
    place: Vec<Option<(usize, Scope)>>,
    drafts: Vec<Draft>,
}

/// Partition every computed node of the graph into kernels.
pub(crate) fn partition(graph: &Graph, mode: FusionMode) -> Vec<Kernel> {
    let mut planner = Planner::new(graph, mode);
    for (id, node) in graph.nodes().collect::<Vec<_>>().into_iter().rev() {
        if node.op.is_bound() || matches!(node.op, Op::Const { .. }) { continue }
        planner.place_node(id);
    }
    planner.materialize_literals();
    if planner.fuse { planner.merge_siblings() }
    planner.finish()
}

impl<'g> Planner<'g> {
    fn new(graph: &'g Graph, mode: FusionMode) -> Self {
        let n = graph.len();
        let mut users = vec![vec![]; n];
        let mut fwd = vec![SmallVec::new(); n];
        for (c, node) in graph.nodes() {
            let mut edge = |u: NodeId, kind: Edge| {
                let kind = if kind == Edge::Elem && graph.node(u).region != node.region { Edge::Outside } else { kind };
                users[u.0].push((c, kind));
            };
            let index_values = |index: &Index| index.iter().filter_map(|a| match a {
                Access::Value(v) => Some(*v), Access::Idx(_) => None }).collect::<SmallVec<[NodeId; 4]>>();
            match &node.op {
                Op::Load { src, index, .. } => {
                    edge(*src, Edge::Gather);
                    index_values(index).into_iter().for_each(|v| edge(v, Edge::Elem));
                }
                Op::Store { target, value, index, .. } | Op::Scatter { target, value, index, .. } => {
                    edge(*target, Edge::Target);
                    edge(*value, Edge::Elem);
                    index_values(index).into_iter().for_each(|v| edge(v, Edge::Elem));
                }
                op => op.upstream().into_iter().for_each(|u| edge(u, Edge::Elem)),
            }
            for d in passes::deps(graph, c) { fwd[d.0].push(c) }
        }
        for region in graph.regions() {
            for carry in &region.carries {
                users[carry.init.0].push((carry.result, Edge::Carry));
                users[carry.next.0].push((carry.result, Edge::Carry));
            }
            if let Extent::Node(end) = region.end { users[end.0].push((region.counter, Edge::Carry)) }
        }
        let mut is_output = vec![false; n];
        for out in graph.outputs() { is_output[out.0] = true }
        Planner {
            graph, fuse: mode == FusionMode::Max, users, fwd, is_output,
            place: vec![None; n], drafts: vec![],
        }
    }

    fn is_reduce(&self, n: NodeId) -> bool { matches!(self.graph.node(n).op, Op::Reduce { .. }) }

    // where a consumer evaluates its operands
    fn use_scope(&self, c: NodeId) -> Option<(usize, Scope)> {
        let (k, scope) = self.place[c.0]?;
        Some(if self.is_reduce(c) { (k, Scope::Inner(c)) } else { (k, scope) })
    }

    fn scope_domain(&self, k: usize, scope: Scope) -> &Shape {
        match scope {
            Scope::Main => &self.drafts[k].domain,
            Scope::Inner(r) => match self.graph.node(r).op {
                Op::Reduce { x, .. } => &self.graph.node(x).shape,
                _ => &self.drafts[k].domain,
            },
        }
    }

    // whether `n` can be computed in place at every point of the scope
    fn fits(&self, n: NodeId, k: usize, scope: Scope) -> bool {
        let node = self.graph.node(n);
        self.drafts[k].region == node.region
            && !(self.is_reduce(n) && scope != Scope::Main)
            && self.graph.symbols.same(&node.shape, self.scope_domain(k, scope))
    }

    fn members(&self, k: usize) -> HashSet<NodeId> {
        let d = &self.drafts[k];
        d.main.iter().chain(d.inner.iter().flat_map(|(_, b)| b.iter())).copied().collect()
    }

    // is any of `targets` reachable from `from` (itself included)
    fn reaches(&self, from: impl IntoIterator<Item = NodeId>, targets: &HashSet<NodeId>) -> bool {
        let mut seen = HashSet::new();
        let mut stack = from.into_iter().collect::<Vec<_>>();
        while let Some(n) = stack.pop() {
            if targets.contains(&n) { return true }
            if !seen.insert(n) { continue }
            stack.extend(self.fwd[n.0].iter().copied());
        }
        false
    }

    fn independent(&self, a: usize, b: usize) -> bool {
        let (ma, mb) = (self.members(a), self.members(b));
        !self.reaches(ma.iter().copied(), &mb) && !self.reaches(mb.iter().copied(), &ma)
    }

    fn new_kernel(&mut self, n: NodeId) -> usize {
        let node = self.graph.node(n);
        let chain = if node.op.is_write() { vec![n] } else { vec![] };
        self.drafts.push(Draft {
            region: node.region,
            domain: node.domain().clone(),
            main: vec![n],
            inner: if self.is_reduce(n) { vec![(n, vec![])] } else { vec![] },
            outputs: vec![(n, chain)],
            alive: true,
        });
        let k = self.drafts.len() - 1;
        self.place[n.0] = Some((k, Scope::Main));
        k
    }

    fn join(&mut self, n: NodeId, k: usize, scope: Scope, output: bool) {
        match scope {
            Scope::Main => {
                self.drafts[k].main.push(n);
                if self.is_reduce(n) { self.drafts[k].inner.push((n, vec![])) }
            }
            Scope::Inner(r) => {
                if let Some((_, body)) = self.drafts[k].inner.iter_mut().find(|(x, _)| *x == r) { body.push(n) }
            }
        }
        if output { self.drafts[k].outputs.push((n, vec![])) }
        self.place[n.0] = Some((k, scope));
    }

    // fold kernel `b` into kernel `a`
    fn merge(&mut self, a: usize, b: usize) {
        let draft = std::mem::replace(&mut self.drafts[b], Draft {
            region: None, domain: Shape::scalar(), main: vec![], inner: vec![], outputs: vec![], alive: false,
        });
        for &m in &draft.main { self.place[m.0] = Some((a, Scope::Main)) }
        for (r, body) in &draft.inner {
            for &m in body { self.place[m.0] = Some((a, Scope::Inner(*r))) }
        }
        let into = &mut self.drafts[a];
        into.main.extend(draft.main);
        into.inner.extend(draft.inner);
        into.outputs.extend(draft.outputs);
    }

    // bring several kernels of the same domain into one, if none depends on another
    fn unify(&mut self, kernels: &[usize]) -> Option<usize> {
        let (&first, rest) = kernels.split_first()?;
        for &k in rest {
            let (a, b) = (&self.drafts[first], &self.drafts[k]);
            if a.region != b.region || !self.graph.symbols.same(&a.domain, &b.domain) { return None }
        }
        for (i, &a) in kernels.iter().enumerate() {
            for &b in &kernels[i + 1..] {
                if !self.independent(a, b) { return None }
            }
        }
        for &k in rest { self.merge(first, k) }
        log::debug!("fuse: merged {} kernels sharing consumers", kernels.len());
        Some(first)
    }

    fn place_node(&mut self, n: NodeId) {
        if self.graph.node(n).op.is_write() { return self.place_write(n) }
        let uses = self.users[n.0].clone();
        let mut buffer = self.is_output[n.0];
        let mut readers = vec![];
        let mut scopes: Vec<(usize, Scope)> = vec![];
        for &(c, edge) in &uses {
            let scope = match edge { Edge::Elem => self.use_scope(c), _ => None };
            match scope {
                Some((k, s)) if self.fits(n, k, s) => if !scopes.contains(&(k, s)) { scopes.push((k, s)) },
                _ => { buffer = true; readers.push(c) }
            }
        }
        if self.fuse && !scopes.is_empty() {
            if let [(k, scope)] = scopes[..] {
                if !buffer { return self.join(n, k, scope, false) }
            }
            if scopes.iter().all(|(_, s)| *s == Scope::Main) {
                let mut kernels = scopes.iter().map(|(k, _)| *k).collect::<Vec<_>>();
                kernels.dedup();
                if let Some(k) = self.unify(&kernels) {
                    let members = self.members(k);
                    if !self.reaches(readers.iter().copied(), &members) {
                        return self.join(n, k, Scope::Main, buffer);
                    }
                }
            }
        }
        self.new_kernel(n);
    }

    // two writes can share a buffer in one pass if no element is written by both at
    // different points, or if both combine order independently
    fn chainable(&self, a: NodeId, c: NodeId) -> bool {
        let (na, nc) = (self.graph.node(a), self.graph.node(c));
        if na.region != nc.region || !self.graph.symbols.same(na.domain(), nc.domain()) { return false }
        match (&na.op, &nc.op) {
            (Op::Scatter { op: x, .. }, Op::Scatter { op: y, .. }) => x == y,
            (Op::Store { index: ia, boundary: ba, .. }, Op::Store { index: ic, boundary: bc, .. }) => {
                ba == bc && ia.len() == ic.len() && ia.iter().zip(ic.iter()).all(|pair| match pair {
                    (Access::Idx(Idx::Const(_)), Access::Idx(Idx::Const(_))) => true,
                    (Access::Idx(x), Access::Idx(y)) => x == y,
                    _ => false,
                })
            }
            _ => false,
        }
    }

    fn place_write(&mut self, n: NodeId) {
        if self.fuse && !self.is_output[n.0] {
            if let [(c, Edge::Target)] = self.users[n.0][..] {
                if let Some((k, _)) = self.place[c.0].filter(|_| self.chainable(n, c)) {
                    self.drafts[k].main.push(n);
                    if let Some((_, chain)) = self.drafts[k].outputs.iter_mut().find(|(_, ch)| ch.contains(&c)) {
                        chain.insert(0, n);
                    }
                    self.place[n.0] = Some((k, Scope::Main));
                    return;
                }
            }
        }
        self.new_kernel(n);
    }

    // literals read as buffers get a fill kernel of their own
    fn materialize_literals(&mut self) {
        let graph = self.graph;
        for (id, node) in graph.nodes() {
            if !matches!(node.op, Op::Const { .. }) { continue }
            let needed = self.is_output[id.0]
                || self.users[id.0].iter().any(|(_, e)| matches!(e, Edge::Gather | Edge::Carry));
            if needed { self.new_kernel(id); }
        }
    }

    // merge independent kernels over the same domain until none are left
    fn merge_siblings(&mut self) {
        loop {
            let mut merged = false;
            'outer: for a in 0..self.drafts.len() {
                for b in a + 1..self.drafts.len() {
                    let (da, db) = (&self.drafts[a], &self.drafts[b]);
                    if !da.alive || !db.alive || da.region != db.region { continue }
                    if !self.graph.symbols.same(&da.domain, &db.domain) || !self.independent(a, b) { continue }
                    log::debug!("fuse: merging sibling kernels over {}", da.domain);
                    self.merge(a, b);
                    merged = true;
                    break 'outer;
                }
            }
            if !merged { break }
        }
    }

    fn finish(self) -> Vec<Kernel> {
        let graph = self.graph;
        let mut kernels = self.drafts.into_iter().filter(|d| d.alive).map(|mut d| {
            d.main.sort();
            d.inner.iter_mut().for_each(|(_, b)| b.sort());
            d.inner.sort();
            d.outputs.sort();
            let members = d.main.iter().chain(d.inner.iter().flat_map(|(_, b)| b.iter())).copied().collect::<HashSet<_>>();
            let mut inputs = vec![];
            for m in d.main.iter().chain(d.inner.iter().flat_map(|(_, b)| b.iter())) {
                for u in buffer_operands(graph, graph.node(*m)) {
                    if !members.contains(&u) && !inputs.contains(&u) { inputs.push(u) }
                }
            }
            let outputs = d.outputs.into_iter().map(|(node, chain)| {
                let init = chain.first().and_then(|w| match graph.node(*w).op {
                    Op::Store { target, .. } | Op::Scatter { target, .. } => Some(init_of(graph, target)),
                    _ => None,
                });
                Output { node, init, chain }
            }).collect();
            let atomic = d.main.iter().any(|m| matches!(graph.node(*m).op, Op::Scatter { .. }));
            Kernel {
                id: 0, region: d.region, domain: d.domain, body: d.main,
                inner: d.inner.into_iter().map(|(reduce, body)| Inner { reduce, body }).collect(),
                inputs, outputs, atomic,
            }
        }).collect::<Vec<_>>();
        kernels.sort_by_key(|k| k.body.first().copied());
        for (id, k) in kernels.iter_mut().enumerate() { k.id = id }
        kernels
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use DType::*;

    fn plan(mode: FusionMode, f: impl for<'t> FnOnce(Tracer<'t>) -> Result<Vec<Tensor<'t>>>) -> Vec<Kernel> {
        let g = passes::simplify(&Graph::trace(Boundary::Clamp, f).unwrap());
        partition(&g, mode)
    }

    #[test]
    fn matmul_scatter_is_one_atomic_kernel() {
        let ks = plan(FusionMode::Max, |t| {
            let a = t.input(&[4, 8], F32)?;
            let b = t.input(&[8, 2], F32)?;
            let mut c = t.zeros(&sh([4, 2]), F32)?;
            let d = sh([4, 2, 8]);
            let [i, j, k] = <[IndexVar; 3]>::try_from(t.indices(&d)).unwrap();
            let prod = a.at([&i, &k])? * b.at([&k, &j])?;
            c.scatter_add([i, j], &prod)?;
            Ok(vec![c])
        });
        assert_eq!(ks.len(), 1);
        assert!(ks[0].atomic);
        assert_eq!(ks[0].domain, sh([4, 2, 8]));
        assert_eq!(ks[0].outputs[0].init, Some(Init::Fill(Scalar::F32(0.0))));
        assert_eq!(ks[0].inputs.len(), 2);
    }

    #[test]
    fn store_chain_shares_one_buffer() {
        let ks = plan(FusionMode::Max, |t| {
            let x = t.input(&[6], F32)?;
            let mut out = t.zeros(&sh([6, 2]), F32)?;
            let d = sh([6]);
            let i = IndexVar::axis(&d, 0);
            let zero = (&i * 0) + 0;
            out.set([i.clone(), zero.clone()], &x)?;
            out.set([i.clone(), zero + 1], &(&x * 2.0))?;
            Ok(vec![out])
        });
        assert_eq!(ks.len(), 1);
        assert_eq!(ks[0].outputs.len(), 1);
        assert_eq!(ks[0].outputs[0].chain.len(), 2);
        assert_eq!(ks[0].outputs[0].init, Some(Init::Fill(Scalar::F32(0.0))));
    }

    #[test]
    fn shared_producer_pulls_consumers_together() {
        let ks = plan(FusionMode::Max, |t| {
            let x = t.input(&[5], F32)?;
            let u = &x * 3.0;
            Ok(vec![&u + 1.0, &u - 1.0])
        });
        assert_eq!(ks.len(), 1);
        assert_eq!(ks[0].outputs.len(), 2);
        let ks = plan(FusionMode::None, |t| {
            let x = t.input(&[5], F32)?;
            let u = &x * 3.0;
            Ok(vec![&u + 1.0, &u - 1.0])
        });
        assert_eq!(ks.len(), 3);
    }

    #[test]
    fn loop_bodies_get_their_own_kernels() {
        let ks = plan(FusionMode::Max, |t| {
            let x = t.input(&[5], F32)?;
            let y = &x + 1.0;
            t.repeat(4usize, &[y], |_, c| Ok(vec![&c[0] * 0.5]))
        });
        assert_eq!(ks.len(), 2);
        assert_eq!(ks[0].region, None);
        assert_eq!(ks[1].region, Some(LoopId(0)));
    }

    #[test]
    fn literal_outputs_are_filled() {
        let ks = plan(FusionMode::Max, |t| Ok(vec![t.fill(&sh([3]), 7i32)?]));
        assert_eq!(ks.len(), 1);
        assert_eq!(ks[0].outputs[0].init, None);
        assert!(ks[0].inputs.is_empty());
    }
}
