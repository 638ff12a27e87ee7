//! Coupled-model hierarchy and direct connect.
//!
//! Users describe a tree of coupled models with port-name couplings and
//! optional Z-functions. Flattening walks every atomic output port through
//! the hierarchy until it reaches atomic input ports, composing the Z
//! functions along the way into a single callable per edge. After that the
//! engines route atomic-to-atomic and never look at the hierarchy again.
//!
//! Dynamic-structure requests mutate the stored structure; the controller
//! re-runs `flatten` afterwards, handing back the model boxes it took out
//! the first time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::message::PortId;
use crate::model::{AtomicModel, DsRequest, ModelSpec, ZFunc};
use crate::SimError;

struct AtomicNode<P> {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    requested_core: Option<usize>,
    model: Option<Box<dyn AtomicModel<P>>>,
}

enum Component<P> {
    Atomic(AtomicNode<P>),
    Coupled(CoupledModel<P>),
}

struct Coupling<P> {
    src_comp: Option<String>,
    src_port: String,
    dst_comp: Option<String>,
    dst_port: String,
    z: Option<ZFunc<P>>,
}

/// A named group of components with boundary ports and couplings.
///
/// Coupling endpoints name direct children; `None` endpoints refer to this
/// coupled model's own boundary ports (external input/output couplings).
pub struct CoupledModel<P> {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    components: Vec<Component<P>>,
    couplings: Vec<Coupling<P>>,
}

impl<P> CoupledModel<P> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            components: Vec::new(),
            couplings: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_input(mut self, port: impl Into<String>) -> Self {
        self.inputs.push(port.into());
        self
    }

    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.outputs.push(port.into());
        self
    }

    pub fn add_atomic(&mut self, spec: ModelSpec<P>) {
        self.components.push(Component::Atomic(AtomicNode {
            name: spec.name,
            inputs: spec.inputs,
            outputs: spec.outputs,
            requested_core: spec.requested_core,
            model: Some(spec.model),
        }));
    }

    pub fn add_coupled(&mut self, child: CoupledModel<P>) {
        self.components.push(Component::Coupled(child));
    }

    /// Internal coupling: child output port to sibling input port.
    pub fn connect(
        &mut self,
        src_comp: impl Into<String>,
        src_port: impl Into<String>,
        dst_comp: impl Into<String>,
        dst_port: impl Into<String>,
        z: Option<ZFunc<P>>,
    ) {
        self.couplings.push(Coupling {
            src_comp: Some(src_comp.into()),
            src_port: src_port.into(),
            dst_comp: Some(dst_comp.into()),
            dst_port: dst_port.into(),
            z,
        });
    }

    /// External input coupling: own boundary input to a child input.
    pub fn connect_input(
        &mut self,
        own_port: impl Into<String>,
        dst_comp: impl Into<String>,
        dst_port: impl Into<String>,
        z: Option<ZFunc<P>>,
    ) {
        self.couplings.push(Coupling {
            src_comp: None,
            src_port: own_port.into(),
            dst_comp: Some(dst_comp.into()),
            dst_port: dst_port.into(),
            z,
        });
    }

    /// External output coupling: a child output to an own boundary output.
    pub fn connect_output(
        &mut self,
        src_comp: impl Into<String>,
        src_port: impl Into<String>,
        own_port: impl Into<String>,
        z: Option<ZFunc<P>>,
    ) {
        self.couplings.push(Coupling {
            src_comp: Some(src_comp.into()),
            src_port: src_port.into(),
            dst_comp: None,
            dst_port: own_port.into(),
            z,
        });
    }

    fn remove_component(&mut self, name: &str) -> bool {
        let before = self.components.len();
        self.components.retain(|c| match c {
            Component::Atomic(a) => a.name != name,
            Component::Coupled(c) => c.name != name,
        });
        if self.components.len() != before {
            self.couplings.retain(|c| {
                c.src_comp.as_deref() != Some(name) && c.dst_comp.as_deref() != Some(name)
            });
            return true;
        }
        for comp in self.components.iter_mut() {
            if let Component::Coupled(child) = comp {
                if child.remove_component(name) {
                    return true;
                }
            }
        }
        false
    }
}

/// One flattened atomic model, ready for allocation.
pub struct FlatAtomic<P> {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub requested_core: Option<usize>,
    pub model: Box<dyn AtomicModel<P>>,
}

/// A direct atomic-to-atomic edge with its composed Z-function.
pub struct FlatLink<P> {
    pub src: usize,
    pub src_port: PortId,
    pub dst: usize,
    pub dst_port: PortId,
    pub z: Option<ZFunc<P>>,
}

/// The result of direct connect: a flat model table plus the edge list.
pub struct FlatModel<P> {
    pub atoms: Vec<FlatAtomic<P>>,
    pub links: Vec<FlatLink<P>>,
}

impl<P> FlatModel<P> {
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.atoms.iter().position(|a| a.name == name)
    }

    /// Reverse adjacency: for each atom, the set of atoms with an edge into it.
    pub fn influencer_map(&self) -> Vec<HashSet<usize>> {
        let mut map = vec![HashSet::new(); self.atoms.len()];
        for link in &self.links {
            map[link.dst].insert(link.src);
        }
        map
    }
}

/// A connection added or severed during the dynamic-structure phase; these
/// operate directly on atomic endpoints, bypassing the hierarchy.
struct DirectEdge<P> {
    src_model: String,
    src_port: String,
    dst_model: String,
    dst_port: String,
    z: Option<ZFunc<P>>,
}

/// Owns the model hierarchy for the lifetime of a simulation and produces the
/// flattened form the engines run on.
pub struct RootModel<P> {
    top: CoupledModel<P>,
    extra: Vec<DirectEdge<P>>,
    severed: HashSet<(String, String, String, String)>,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
enum Dir {
    In,
    Out,
}

type PortNode = (usize, Dir, usize);

#[derive(Copy, Clone)]
enum CompKind {
    Atomic(usize),
    Coupled,
}

struct Walker<P> {
    kinds: Vec<CompKind>,
    ports: Vec<HashMap<(Dir, String), usize>>,
    edges: HashMap<PortNode, Vec<(PortNode, Option<ZFunc<P>>)>>,
}

impl<P: 'static> RootModel<P> {
    pub fn new(top: CoupledModel<P>) -> Self {
        Self {
            top,
            extra: Vec::new(),
            severed: HashSet::new(),
        }
    }

    /// A root holding a single atomic model, the common case for the
    /// sequential scenarios.
    pub fn single(spec: ModelSpec<P>) -> Self {
        let mut top = CoupledModel::new("root");
        top.add_atomic(spec);
        Self::new(top)
    }

    /// Apply a batch of dynamic-structure requests. Any change invalidates
    /// the previous direct connect; the controller must flatten again.
    pub fn apply_requests(&mut self, requests: Vec<DsRequest<P>>) -> Result<(), SimError> {
        for request in requests {
            match request {
                DsRequest::AddModel(spec) => {
                    debug!("root: DS adding model {}", spec.name);
                    self.top.add_atomic(spec);
                }
                DsRequest::RemoveModel(name) => {
                    debug!("root: DS removing model {name}");
                    if !self.top.remove_component(&name) {
                        return Err(SimError::DsPhase(format!(
                            "removal of unknown model `{name}`"
                        )));
                    }
                    self.extra
                        .retain(|e| e.src_model != name && e.dst_model != name);
                }
                DsRequest::Connect {
                    src_model,
                    src_port,
                    dst_model,
                    dst_port,
                    z,
                } => {
                    self.severed.remove(&(
                        src_model.clone(),
                        src_port.clone(),
                        dst_model.clone(),
                        dst_port.clone(),
                    ));
                    self.extra.push(DirectEdge {
                        src_model,
                        src_port,
                        dst_model,
                        dst_port,
                        z,
                    });
                }
                DsRequest::Disconnect {
                    src_model,
                    src_port,
                    dst_model,
                    dst_port,
                } => {
                    let before = self.extra.len();
                    self.extra.retain(|e| {
                        !(e.src_model == src_model
                            && e.src_port == src_port
                            && e.dst_model == dst_model
                            && e.dst_port == dst_port)
                    });
                    if self.extra.len() == before {
                        self.severed
                            .insert((src_model, src_port, dst_model, dst_port));
                    }
                }
            }
        }
        Ok(())
    }

    /// Flatten the hierarchy to atomic models and direct edges.
    ///
    /// `returned` carries model boxes previously taken out by an earlier
    /// flatten (the DS re-run); on the first call it is empty and the boxes
    /// come from the tree itself.
    pub fn flatten(
        &mut self,
        mut returned: HashMap<String, Box<dyn AtomicModel<P>>>,
    ) -> Result<FlatModel<P>, SimError> {
        let mut walker = Walker {
            kinds: Vec::new(),
            ports: Vec::new(),
            edges: HashMap::new(),
        };
        let mut atoms: Vec<FlatAtomic<P>> = Vec::new();
        let mut seen = HashSet::new();
        let mut atom_comp: Vec<usize> = Vec::new();

        collect(
            &mut self.top,
            &mut walker,
            &mut atoms,
            &mut atom_comp,
            &mut seen,
            &mut returned,
        )?;

        let mut links: Vec<FlatLink<P>> = Vec::new();
        for (atom_idx, &comp_id) in atom_comp.iter().enumerate() {
            for (out_idx, _) in atoms[atom_idx].outputs.iter().enumerate() {
                let start: PortNode = (comp_id, Dir::Out, out_idx);
                let mut visited: HashSet<PortNode> = HashSet::new();
                let mut stack: Vec<(PortNode, Vec<ZFunc<P>>)> = vec![(start, Vec::new())];
                while let Some((node, zs)) = stack.pop() {
                    let outgoing = match walker.edges.get(&node) {
                        Some(e) => e,
                        None => continue,
                    };
                    for (next, z) in outgoing {
                        let mut path = zs.clone();
                        if let Some(z) = z {
                            path.push(Arc::clone(z));
                        }
                        match walker.kinds[next.0] {
                            CompKind::Atomic(dst_idx) if next.1 == Dir::In => {
                                let key = (
                                    atoms[atom_idx].name.clone(),
                                    atoms[atom_idx].outputs[out_idx].clone(),
                                    atoms[dst_idx].name.clone(),
                                    atoms[dst_idx].inputs[next.2].clone(),
                                );
                                if self.severed.contains(&key) {
                                    continue;
                                }
                                links.push(FlatLink {
                                    src: atom_idx,
                                    src_port: PortId(out_idx as u32),
                                    dst: dst_idx,
                                    dst_port: PortId(next.2 as u32),
                                    z: compose(path),
                                });
                            }
                            _ => {
                                if visited.insert(*next) {
                                    stack.push((*next, path));
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut flat = FlatModel { atoms, links };
        self.append_direct_edges(&mut flat)?;
        debug!(
            "root: direct connect produced {} atoms, {} links",
            flat.atoms.len(),
            flat.links.len()
        );
        Ok(flat)
    }

    fn append_direct_edges(&self, flat: &mut FlatModel<P>) -> Result<(), SimError> {
        for edge in &self.extra {
            let src = flat.index_of(&edge.src_model).ok_or_else(|| {
                SimError::DsPhase(format!("connection from unknown model `{}`", edge.src_model))
            })?;
            let dst = flat.index_of(&edge.dst_model).ok_or_else(|| {
                SimError::DsPhase(format!("connection to unknown model `{}`", edge.dst_model))
            })?;
            let src_port = flat.atoms[src]
                .outputs
                .iter()
                .position(|p| *p == edge.src_port)
                .ok_or_else(|| {
                    SimError::ModelContract(format!(
                        "model `{}` has no output port `{}`",
                        edge.src_model, edge.src_port
                    ))
                })?;
            let dst_port = flat.atoms[dst]
                .inputs
                .iter()
                .position(|p| *p == edge.dst_port)
                .ok_or_else(|| {
                    SimError::ModelContract(format!(
                        "model `{}` has no input port `{}`",
                        edge.dst_model, edge.dst_port
                    ))
                })?;
            flat.links.push(FlatLink {
                src,
                src_port: PortId(src_port as u32),
                dst,
                dst_port: PortId(dst_port as u32),
                z: edge.z.clone(),
            });
        }
        Ok(())
    }
}

fn compose<P: 'static>(mut fns: Vec<ZFunc<P>>) -> Option<ZFunc<P>> {
    match fns.len() {
        0 => None,
        1 => fns.pop(),
        _ => Some(Arc::new(move |p| fns.iter().fold(p, |acc, f| f(acc)))),
    }
}

/// DFS over the component tree: registers every component, its port tables
/// and the coupling edges of each coupled level.
fn collect<P>(
    coupled: &mut CoupledModel<P>,
    walker: &mut Walker<P>,
    atoms: &mut Vec<FlatAtomic<P>>,
    atom_comp: &mut Vec<usize>,
    seen: &mut HashSet<String>,
    returned: &mut HashMap<String, Box<dyn AtomicModel<P>>>,
) -> Result<usize, SimError> {
    if !seen.insert(coupled.name.clone()) {
        return Err(SimError::Config(format!(
            "duplicate model name `{}`",
            coupled.name
        )));
    }
    let own_id = walker.kinds.len();
    walker.kinds.push(CompKind::Coupled);
    let mut ports = HashMap::new();
    for (i, p) in coupled.inputs.iter().enumerate() {
        ports.insert((Dir::In, p.clone()), i);
    }
    for (i, p) in coupled.outputs.iter().enumerate() {
        ports.insert((Dir::Out, p.clone()), i);
    }
    walker.ports.push(ports);

    let mut child_ids: HashMap<String, usize> = HashMap::new();
    for comp in coupled.components.iter_mut() {
        match comp {
            Component::Atomic(node) => {
                if !seen.insert(node.name.clone()) {
                    return Err(SimError::Config(format!(
                        "duplicate model name `{}`",
                        node.name
                    )));
                }
                let comp_id = walker.kinds.len();
                let atom_idx = atoms.len();
                walker.kinds.push(CompKind::Atomic(atom_idx));
                let mut ports = HashMap::new();
                for (i, p) in node.inputs.iter().enumerate() {
                    ports.insert((Dir::In, p.clone()), i);
                }
                for (i, p) in node.outputs.iter().enumerate() {
                    ports.insert((Dir::Out, p.clone()), i);
                }
                walker.ports.push(ports);
                let model = match node.model.take().or_else(|| returned.remove(&node.name)) {
                    Some(m) => m,
                    None => {
                        return Err(SimError::Config(format!(
                            "model `{}` has no implementation attached",
                            node.name
                        )))
                    }
                };
                atoms.push(FlatAtomic {
                    name: node.name.clone(),
                    inputs: node.inputs.clone(),
                    outputs: node.outputs.clone(),
                    requested_core: node.requested_core,
                    model,
                });
                atom_comp.push(comp_id);
                child_ids.insert(node.name.clone(), comp_id);
            }
            Component::Coupled(child) => {
                let name = child.name.clone();
                let id = collect(child, walker, atoms, atom_comp, seen, returned)?;
                child_ids.insert(name, id);
            }
        }
    }

    for coupling in &coupled.couplings {
        let (src_id, src_dir) = match &coupling.src_comp {
            Some(name) => (
                *child_ids.get(name).ok_or_else(|| {
                    SimError::Config(format!(
                        "coupling in `{}` references unknown component `{name}`",
                        coupled.name
                    ))
                })?,
                Dir::Out,
            ),
            None => (own_id, Dir::In),
        };
        let (dst_id, dst_dir) = match &coupling.dst_comp {
            Some(name) => (
                *child_ids.get(name).ok_or_else(|| {
                    SimError::Config(format!(
                        "coupling in `{}` references unknown component `{name}`",
                        coupled.name
                    ))
                })?,
                Dir::In,
            ),
            None => (own_id, Dir::Out),
        };
        let src_port = *walker.ports[src_id]
            .get(&(src_dir, coupling.src_port.clone()))
            .ok_or_else(|| {
                SimError::Config(format!(
                    "coupling in `{}` references unknown port `{}`",
                    coupled.name, coupling.src_port
                ))
            })?;
        let dst_port = *walker.ports[dst_id]
            .get(&(dst_dir, coupling.dst_port.clone()))
            .ok_or_else(|| {
                SimError::Config(format!(
                    "coupling in `{}` references unknown port `{}`",
                    coupled.name, coupling.dst_port
                ))
            })?;
        walker
            .edges
            .entry((src_id, src_dir, src_port))
            .or_default()
            .push(((dst_id, dst_dir, dst_port), coupling.z.clone()));
    }
    Ok(own_id)
}
