use std::collections::HashMap;

use smallvec::*;

use crate::error::*;
use crate::pre::*;

/// Common subexpression elimination followed by dead code elimination.
/// The result is renumbered densely, in trace order.
pub(crate) fn simplify(graph: &Graph) -> Graph {
    let (merged, hits) = eliminate_common(graph);
    let (live, live_loops) = live_nodes(&merged);
    let out = compact(&merged, &live, &live_loops);
    log::debug!("simplify: {hits} common subexpressions, {} dead nodes", merged.len() - out.len());
    out
}

// the nodes a node waits for, including the implicit edges of loop regions
pub(crate) fn deps(graph: &Graph, id: NodeId) -> SmallVec<[NodeId; 4]> {
    let node = graph.node(id);
    let mut up = node.op.upstream();
    match node.op {
        Op::LoopCounter { region } => {
            if let Extent::Node(end) = graph.region(region).end { up.push(end) }
        }
        Op::LoopParam { region, slot } => up.push(graph.region(region).carries[slot].init),
        Op::LoopResult { region, slot } => {
            let r = graph.region(region);
            up.push(r.carries[slot].init);
            up.push(r.carries[slot].next);
            if let Extent::Node(end) = r.end { up.push(end) }
        }
        _ => {},
    }
    up
}

fn eliminate_common(graph: &Graph) -> (Graph, usize) {
    let mut out = Graph { symbols: graph.symbols.clone(), ..Default::default() };
    let mut seen: HashMap<(Op, DType, Shape, Option<LoopId>), NodeId> = HashMap::new();
    let mut remap: Vec<NodeId> = Vec::with_capacity(graph.len());
    let mut hits = 0;
    for (_, node) in graph.nodes() {
        let op = node.op.map_inputs(|n| remap[n.0]);
        let key = (op.clone(), node.dtype, graph.symbols.canon_shape(&node.shape), node.region);
        let id = match seen.get(&key) {
            Some(&id) if !op.is_bound() => { hits += 1; id }
            _ => {
                let id = out.push(Node { op, dtype: node.dtype, shape: node.shape.clone(), region: node.region });
                seen.insert(key, id);
                id
            }
        };
        remap.push(id);
    }
    let map = |n: NodeId| remap[n.0];
    out.loops = graph.loops.iter().map(|r| LoopRegion {
        id: r.id,
        parent: r.parent,
        end: match r.end { Extent::Node(n) => Extent::Node(map(n)), fixed => fixed },
        counter: map(r.counter),
        carries: r.carries.iter().map(|c| Carry {
            init: map(c.init), param: map(c.param), next: map(c.next), result: map(c.result),
        }).collect(),
    }).collect();
    out.inputs = graph.inputs.iter().copied().map(map).collect();
    out.outputs = graph.outputs.iter().copied().map(map).collect();
    (out, hits)
}

// reachable from the outputs; a loop is live once one of its results is
fn live_nodes(graph: &Graph) -> (Vec<bool>, Vec<bool>) {
    let mut live = vec![false; graph.len()];
    let mut live_loops = vec![false; graph.loops.len()];
    let mut stack = graph.outputs.clone();
    // inputs keep their slots even when unused
    stack.extend(graph.inputs.iter().copied());
    while let Some(id) = stack.pop() {
        if live[id.0] { continue }
        live[id.0] = true;
        stack.extend(deps(graph, id));
        let mut wake = match graph.node(id).op {
            Op::LoopResult { region, .. } => Some(region),
            _ => graph.node(id).region,
        };
        while let Some(r) = wake {
            if live_loops[r.0] { break }
            live_loops[r.0] = true;
            let region = graph.region(r);
            stack.push(region.counter);
            for c in &region.carries { stack.extend([c.init, c.param, c.next, c.result]) }
            if let Extent::Node(end) = region.end { stack.push(end) }
            wake = region.parent;
        }
    }
    (live, live_loops)
}

fn compact(graph: &Graph, live: &[bool], live_loops: &[bool]) -> Graph {
    let mut node_map = vec![None; graph.len()];
    let mut loop_map = vec![None; graph.loops.len()];
    let mut next = 0;
    for (r, &l) in live_loops.iter().enumerate() {
        if l { loop_map[r] = Some(LoopId(next)); next += 1 }
    }
    let lmap = |r: LoopId| loop_map[r.0].unwrap_or(r);
    let mut out = Graph { symbols: graph.symbols.clone(), ..Default::default() };
    for (id, node) in graph.nodes().filter(|(id, _)| live[id.0]) {
        let op = node.op.map_inputs(|n| node_map[n.0].unwrap_or(n));
        let op = match op {
            Op::LoopCounter { region } => Op::LoopCounter { region: lmap(region) },
            Op::LoopParam { region, slot } => Op::LoopParam { region: lmap(region), slot },
            Op::LoopResult { region, slot } => Op::LoopResult { region: lmap(region), slot },
            op => op,
        };
        let new = out.push(Node { op, dtype: node.dtype, shape: node.shape.clone(), region: node.region.map(lmap) });
        node_map[id.0] = Some(new);
    }
    let map = |n: NodeId| node_map[n.0].unwrap_or(n);
    out.loops = graph.loops.iter().filter(|r| live_loops[r.id.0]).map(|r| LoopRegion {
        id: lmap(r.id),
        parent: r.parent.map(lmap),
        end: match r.end { Extent::Node(n) => Extent::Node(map(n)), fixed => fixed },
        counter: map(r.counter),
        carries: r.carries.iter().map(|c| Carry {
            init: map(c.init), param: map(c.param), next: map(c.next), result: map(c.result),
        }).collect(),
    }).collect();
    out.inputs = graph.inputs.iter().copied().map(map).collect();
    out.outputs = graph.outputs.iter().copied().map(map).collect();
    out
}

/// Every dynamic dimension must be pinned or appear in an input shape.
pub(crate) fn check_resolvable(graph: &Graph) -> Result<()> {
    let symbols = &graph.symbols;
    let mut bound = vec![false; symbols.len()];
    for &input in &graph.inputs {
        for s in graph.node(input).shape.vars() { bound[symbols.find(s)] = true }
    }
    for (id, node) in graph.nodes() {
        for s in node.shape.vars().into_iter().chain(node.domain().vars()) {
            if symbols.pinned(s).is_none() && !bound[symbols.find(s)] {
                return Err(Error::ShapeUnresolvable(format!(
                    "dimension s{s} of {id} is neither fixed nor taken from an input")));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use DType::*;

    #[test]
    fn common_subexpressions_merge() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let a = t.input(&[4], F32)?;
            let x = a.sin()? + a.sin()?;
            let y = a.sin()? * 3.0;
            Ok(vec![x, y])
        }).unwrap();
        let s = simplify(&g);
        let sines = s.nodes().filter(|(_, n)| matches!(n.op, Op::Unary { op: UnaryOp::Sin, .. })).count();
        assert_eq!(sines, 1);
        assert_eq!(s.outputs().len(), 2);
    }

    #[test]
    fn dead_nodes_and_loops_go() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let a = t.input(&[4], F32)?;
            let _unused = a.exp()?;
            let _dead_loop = t.repeat(2usize, &[a.clone()], |_, c| Ok(vec![&c[0] + 1.0]))?;
            let live = t.repeat(3usize, &[a.clone()], |_, c| Ok(vec![&c[0] * 2.0]))?;
            Ok(live)
        }).unwrap();
        let s = simplify(&g);
        assert_eq!(s.regions().len(), 1);
        assert_eq!(s.regions()[0].id, LoopId(0));
        assert!(s.nodes().all(|(_, n)| !matches!(n.op, Op::Unary { op: UnaryOp::Exp, .. })));
        let carry = s.regions()[0].carries[0];
        assert_eq!(s.outputs(), &[carry.result]);
        assert!(matches!(s.node(carry.param).op, Op::LoopParam { region: LoopId(0), slot: 0 }));
        assert_eq!(s.node(carry.next).region, Some(LoopId(0)));
    }

    #[test]
    fn constants_inside_and_outside_loops_stay_apart() {
        let g = Graph::trace(Boundary::Clamp, |t| {
            let a = t.input(&[4], F32)?;
            let b = &a + 1.0;
            t.repeat(3usize, &[b], |_, c| Ok(vec![&c[0] + 1.0]))
        }).unwrap();
        let s = simplify(&g);
        let ones = s.nodes().filter(|(_, n)| n.op == Op::Const { value: Scalar::F32(1.0) }).count();
        assert_eq!(ones, 2);
    }
}
