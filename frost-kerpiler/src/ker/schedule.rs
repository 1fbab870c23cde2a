use std::collections::{BTreeSet, HashMap};

use super::*;

#[derive(Debug, Clone, Copy)]
enum Item {
    Kernel(usize),
    Loop(LoopId),
}

/// Order the kernels and child loops of one region and compute where each buffer
/// of the region dies. Ties between ready steps go to the lowest node id.
pub(crate) fn block(graph: &Graph, kernels: &[Kernel], region: Option<LoopId>) -> Block {
    let mut items = vec![];
    let mut keys = vec![];
    for k in kernels.iter().filter(|k| k.region == region) {
        keys.push(k.body.first().map(|n| n.0).unwrap_or(0));
        items.push(Item::Kernel(k.id));
    }
    for r in graph.regions().iter().filter(|r| r.parent == region) {
        keys.push(r.counter.0);
        items.push(Item::Loop(r.id));
    }

    // which item fills each buffer of this region
    let mut producer: HashMap<NodeId, usize> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        match *item {
            Item::Kernel(k) => kernels[k].outputs.iter().for_each(|o| { producer.insert(o.node, i); }),
            Item::Loop(r) => graph.region(r).carries.iter().for_each(|c| { producer.insert(c.result, i); }),
        }
    }

    let needs = items.iter().enumerate().map(|(i, item)| {
        let mut reads = match *item {
            Item::Kernel(k) => kernel_reads(&kernels[k]),
            Item::Loop(r) => loop_reads(graph, r),
        };
        reads.retain(|n| producer.get(n).map_or(false, |&p| p != i));
        reads.sort();
        reads.dedup();
        reads
    }).collect::<Vec<_>>();

    // Kahn's algorithm over buffer dependencies
    let mut waiting = needs.iter().map(|reads| reads.iter().map(|n| producer[n]).collect::<BTreeSet<_>>()).collect::<Vec<_>>();
    let mut ready = (0..items.len()).filter(|&i| waiting[i].is_empty()).map(|i| (keys[i], i)).collect::<BTreeSet<_>>();
    let mut order = vec![];
    let mut done = vec![false; items.len()];
    while let Some((key, i)) = ready.iter().next().copied() {
        ready.remove(&(key, i));
        done[i] = true;
        order.push(i);
        for j in 0..items.len() {
            if !done[j] && waiting[j].remove(&i) && waiting[j].is_empty() { ready.insert((keys[j], j)); }
        }
    }

    let keep = match region {
        None => graph.outputs().to_vec(),
        Some(r) => graph.region(r).carries.iter().map(|c| c.next).collect(),
    };
    let mut last: HashMap<NodeId, usize> = HashMap::new();
    for (s, &i) in order.iter().enumerate() {
        // a buffer nobody reads dies right after it is written
        for (&n, &p) in &producer { if p == i { last.entry(n).or_insert(s); } }
        for &n in &needs[i] { last.insert(n, s); }
    }
    let mut frees = vec![vec![]; order.len()];
    for (n, s) in last {
        if !keep.contains(&n) { frees[s].push(n) }
    }
    frees.iter_mut().for_each(|f| f.sort());

    let steps = order.iter().map(|&i| match items[i] {
        Item::Kernel(k) => Step::Kernel(k),
        Item::Loop(r) => Step::Loop(LoopStep { region: r, body: block(graph, kernels, Some(r)) }),
    }).collect();
    Block { steps, frees }
}

// nodes a kernel reads as buffers, including the buffers its outputs start from
fn kernel_reads(kernel: &Kernel) -> Vec<NodeId> {
    let mut reads = kernel.inputs.clone();
    for out in &kernel.outputs {
        if let Some(Init::Copy(n)) = out.init { reads.push(n) }
    }
    reads
}

// everything a loop and its nested bodies read from outside; a carried `next`
// may be any value visible from the body, not only one computed inside it
fn loop_reads(graph: &Graph, r: LoopId) -> Vec<NodeId> {
    let outer = graph.region(r).parent;
    let mut reads = vec![];
    for region in graph.regions().iter().filter(|x| graph.child_towards(outer, Some(x.id)) == Some(r)) {
        reads.extend(region.carries.iter().flat_map(|c| [c.init, c.next]));
        if let Extent::Node(end) = region.end { reads.push(end) }
    }
    for (_, node) in graph.nodes() {
        if graph.child_towards(outer, node.region) == Some(r) {
            reads.extend(node.op.upstream());
        }
    }
    reads
}

#[cfg(test)]
mod test {
    use super::*;
    use DType::*;

    fn program(f: impl for<'t> FnOnce(Tracer<'t>) -> Result<Vec<Tensor<'t>>>) -> Program {
        Program::plan(&Graph::trace(Boundary::Clamp, f).unwrap(), FusionMode::Max).unwrap()
    }

    #[test]
    fn intermediates_die_after_last_reader() {
        let p = program(|t| {
            let x = t.input(&[4], F32)?;
            let s = x.sum(0)?;
            let i = t.indices(&sh([4]));
            let y = &x * &s;
            let shifted = y.at([&i[0] + 1])?;
            Ok(vec![shifted])
        });
        // sum, scale and the shifted read each need their own pass
        assert_eq!(p.kernels().len(), 3);
        let steps = &p.main().steps;
        assert_eq!(steps, &vec![Step::Kernel(0), Step::Kernel(1), Step::Kernel(2)]);
        let frees = &p.main().frees;
        let sum = p.kernels()[0].outputs[0].node;
        let scaled = p.kernels()[1].outputs[0].node;
        assert_eq!(frees[1], vec![sum]);
        assert_eq!(frees[2], vec![scaled]);
        assert!(p.main().frees.iter().flatten().all(|n| !p.graph().outputs().contains(n)));
    }

    #[test]
    fn loops_wait_for_their_inputs() {
        let p = program(|t| {
            let x = t.input(&[4], F32)?;
            let y = x.exp()?;
            let n = t.constant(3i32)?;
            let out = t.repeat(&n, &[y.clone()], |_, c| Ok(vec![&c[0] + &y]))?;
            Ok(out)
        });
        let steps = &p.main().steps;
        assert_eq!(steps.len(), 3);
        // the fill of the trip count and exp are independent, then the loop
        assert!(matches!(steps[2], Step::Loop(_)));
        let Step::Loop(body) = &steps[2] else { unreachable!() };
        assert_eq!(body.body.steps.len(), 1);
        // the carried value is kept, not freed, inside the body
        assert!(body.body.frees.iter().flatten().next().is_none());
    }

    #[test]
    fn outer_values_carried_as_next_stay_alive() {
        let p = program(|t| {
            let x = t.input(&[4], F32)?;
            let y = x.exp()?;
            t.repeat(3usize, &[x.clone()], |_, _| Ok(vec![y.clone()]))
        });
        let exp = p.kernels()[0].outputs[0].node;
        let steps = &p.main().steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0], Step::Kernel(0));
        assert!(matches!(steps[1], Step::Loop(_)));
        // freed after the loop, not right after it is written
        assert!(p.main().frees[0].is_empty());
        assert_eq!(p.main().frees[1], vec![exp]);
    }
}
