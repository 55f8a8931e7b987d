//! The online partitioning snapshot: initial group construction, directive
//! annotation, structural merging, and repeated-block discovery.
//!
//! All passes iterate the group DAG in topological order and are restartable;
//! the whole pipeline is deterministic for a fixed model and context. Merge
//! decisions never consult cost estimates, only local shape rules and the
//! meta-interconnect keys of group boundaries.

use crate::op_graph::{MetaDesc, NodeRole, OpGraph, OpNodeId};
use crate::partitioner::group::{Group, GroupDag, GroupHandle, MetaInterconnect};
use crate::partitioner::patterns::{self, GraphRewrite};
use crate::partitioner::repeated::{Archetype, RepeatId, RepeatPool, Repeated};
use crate::partitioner::{AvoidKind, PartitionError, PassContext};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub type PortsMap = HashMap<(OpNodeId, OpNodeId), (usize, usize)>;
pub type ProdConsMap = HashMap<OpNodeId, (BTreeSet<OpNodeId>, BTreeSet<OpNodeId>)>;
pub type LayerMatches = BTreeMap<String, Vec<BTreeSet<String>>>;

/// A node gets its own group iff it is a compute operation. A `Convert` whose
/// single input comes straight from a constant counts as part of the constant
/// and is skipped; a multi-input `Convert` is operational.
pub(crate) fn is_op(model: &OpGraph, id: OpNodeId) -> bool {
    let node = model.node(id);
    match node.role {
        NodeRole::Constant | NodeRole::Parameter | NodeRole::Output => false,
        NodeRole::Compute => {
            if node.kind == "Convert"
                && node.inputs.len() == 1
                && model.node(node.inputs[0].source).role == NodeRole::Constant
            {
                return false;
            }
            true
        }
    }
}

pub struct Snapshot {
    model: OpGraph,
    ctx: PassContext,
    dag: GroupDag,
    node_to_prod_cons: ProdConsMap,
    ports_map: PortsMap,
    repeats: RepeatPool,
    matches: LayerMatches,
}

impl Snapshot {
    pub fn new(model: OpGraph, ctx: PassContext) -> Self {
        Self {
            model,
            ctx,
            dag: GroupDag::new(),
            node_to_prod_cons: ProdConsMap::new(),
            ports_map: PortsMap::new(),
            repeats: RepeatPool::new(),
            matches: LayerMatches::new(),
        }
    }

    /// Run the whole pipeline: build, annotate, merge structurally, discover
    /// repeated blocks.
    pub fn run(&mut self) -> Result<(), PartitionError> {
        self.build_graph();
        self.early_avoids();
        self.early_regroup();
        self.repeat(Self::collect_lhf)?;
        self.fuse_remnants_extended()?;
        self.repeated_blocks()?;
        Ok(())
    }

    /// Wrap each operational node in a singleton group and mirror the node
    /// level edges at the group level. Also populates the producer/consumer
    /// index and the ports map consumed downstream.
    pub fn build_graph(&mut self) {
        log::info!("Online partitioning: parsing model into initial groups");

        let mut gid = 0usize;
        for id in self.model.ordered_nodes().collect::<Vec<_>>() {
            if !is_op(&self.model, id) {
                continue;
            }
            self.node_to_prod_cons.insert(id, Default::default());
            self.dag.add_group(Group::new(gid, id));
            gid += 1;
        }

        for handle in self.dag.nodes() {
            let node_id = self.dag.group(handle).get_initial_node();
            let node = self.model.node(node_id);

            for port in 0..node.outputs.len() {
                for &(child, child_input) in self.model.port_readers(node_id, port) {
                    let child_port = self.model.node(child).inputs[child_input].port;
                    debug_assert_eq!(child_port, port);
                    self.node_to_prod_cons
                        .get_mut(&node_id)
                        .expect("operational nodes are indexed")
                        .1
                        .insert(child);
                    self.ports_map
                        .entry((node_id, child))
                        .or_insert((port, child_input));
                    if is_op(&self.model, child)
                        && let Some(child_handle) = self.dag.get_group_of(child)
                    {
                        self.dag.link(handle, child_handle);
                    }
                }
            }

            for (index, input) in node.inputs.iter().enumerate() {
                let parent = input.source;
                self.node_to_prod_cons
                    .get_mut(&node_id)
                    .expect("operational nodes are indexed")
                    .0
                    .insert(parent);
                self.ports_map
                    .entry((parent, node_id))
                    .or_insert((input.port, index));
                if is_op(&self.model, parent)
                    && let Some(parent_handle) = self.dag.get_group_of(parent)
                {
                    self.dag.link(parent_handle, handle);
                }
            }
        }

        log::debug!("Initial number of groups: {}", self.graph_size());
    }

    /// Apply AVOID directives. Operation directives match the initial node of
    /// each (still singleton) group directly; pattern directives go through
    /// the pattern rewriter. Runs once, before any merge.
    pub fn early_avoids(&mut self) {
        log::info!("Online partitioning: executing early_avoids pass");

        let mut rewr = GraphRewrite::new();
        let mut handle_patterns = false;

        let avoids = self.ctx.avoids.clone();
        for avoid in &avoids {
            match avoid.kind {
                AvoidKind::Op => {
                    for handle in self.dag.sorted() {
                        let initial = self.dag.group(handle).get_initial_node();
                        if self.model.node(initial).kind == avoid.pattern {
                            self.dag.group_mut(handle).avoid(&avoid.device);
                        }
                    }
                }
                AvoidKind::Pattern => {
                    if avoid.pattern != "RMSNorm" {
                        log::warn!(
                            "AVOID only supports RMSNorm as a pattern (don't confuse with operations). \
                             Avoid pattern {} is skipped!",
                            avoid.pattern
                        );
                        continue;
                    }
                    handle_patterns = true;
                    rewr.add_matcher(patterns::rms_norm_avoid(&avoid.device));
                }
            }
        }

        if handle_patterns {
            rewr.run_on_graph(&mut self.model);
            self.apply_node_annotations();
        }
    }

    /// Apply ISOLATE directives through the pattern rewriter. Runs once,
    /// before any merge.
    pub fn early_regroup(&mut self) {
        log::info!("Online partitioning: executing early_regroup pass");

        let mut rewr = GraphRewrite::new();
        let mut handle_patterns = false;

        for isolate in &self.ctx.isolates {
            let matcher = match isolate.pattern.as_str() {
                "RMSNorm" => patterns::rms_norm(&isolate.tag),
                "SwishMultXMM" => patterns::swish_mult_xmm(&isolate.tag),
                "DequantMatMulCW" => patterns::dequant_matmul_cw(&isolate.tag),
                "DequantMatMulGQ" => patterns::dequant_matmul_gq(&isolate.tag),
                "AdditionalCompute" => patterns::additional_compute(&isolate.tag),
                other => {
                    log::warn!(
                        "ISOLATE only supports RMSNorm, SwishMultXMM, DequantMatMulCW, DequantMatMulGQ \
                         and AdditionalCompute as patterns. Isolate pattern {} is skipped!",
                        other
                    );
                    continue;
                }
            };
            handle_patterns = true;
            rewr.add_matcher(matcher);
        }

        if handle_patterns {
            rewr.run_on_graph(&mut self.model);
            self.apply_node_annotations();
        }
    }

    fn apply_node_annotations(&mut self) {
        for id in self.model.ordered_nodes().collect::<Vec<_>>() {
            let metadata = self.model.node(id).metadata.clone();
            let Some(handle) = self.dag.get_group_of(id) else {
                continue;
            };
            for device in &metadata.avoided_devices {
                self.dag.group_mut(handle).avoid(device);
            }
            if let Some(tag) = &metadata.isolate_tag {
                self.dag.group_mut(handle).isolate(tag);
            }
        }
    }

    /// Linear-head fuse: collapse straight-line producer/consumer pairs. The
    /// downstream group absorbs its sole producer, left to right along the
    /// topological order.
    pub fn collect_lhf(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing collect_lhf pass");

        for handle in self.dag.sorted() {
            if !self.dag.contains(handle) {
                continue;
            }
            let producers = self.dag.producers(handle);
            if producers.len() != 1 {
                continue;
            }
            let producer = producers[0];
            if !self.dag.contains(producer) || self.dag.consumers(producer).len() != 1 {
                continue;
            }
            if self.dag.group(handle).is_frozen() || self.dag.group(producer).is_frozen() {
                continue;
            }
            if self.graph_size() <= self.ctx.min_graph_size {
                break;
            }
            self.dag.fuse(handle, producer);
        }
        Ok(())
    }

    /// Fold remaining small groups into neighbors: remnants downstream first,
    /// then sibling inputs, each run to a fixed point.
    pub fn fuse_remnants_extended(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing fuse_remnants_extended pass");
        self.repeat(Self::fuse_remnants)?;
        self.repeat(Self::fuse_inputs)?;
        Ok(())
    }

    /// For each group, fold it into its smallest non-frozen consumer that can
    /// be reached without closing a cycle. One merge per group per sweep.
    pub fn fuse_remnants(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing fuse_remnants pass");

        for handle in self.dag.sorted() {
            if !self.dag.contains(handle) {
                continue;
            }
            if self.dag.group(handle).is_frozen() {
                continue;
            }
            let mut consumers: Vec<GroupHandle> = self
                .dag
                .consumers(handle)
                .into_iter()
                .filter(|&c| self.dag.contains(c))
                .collect();
            if consumers.is_empty() {
                continue;
            }
            consumers.sort_by_key(|&c| {
                let group = self.dag.group(c);
                (group.size(), group.get_id())
            });
            for consumer in consumers {
                if !self.dag.contains(consumer) {
                    continue;
                }
                if self.dag.has_cycle(handle, consumer) {
                    continue;
                }
                if self.dag.group(consumer).is_frozen() {
                    continue;
                }
                self.dag.fuse_with(handle, consumer);
                break;
            }
            if self.graph_size() <= self.ctx.min_graph_size {
                break;
            }
        }
        Ok(())
    }

    /// For each group, merge one mutually acyclic pair of its non-frozen
    /// producers into a single sibling. One merge per group per sweep.
    pub fn fuse_inputs(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing fuse_inputs pass");

        for handle in self.dag.sorted() {
            if !self.dag.contains(handle) {
                continue;
            }
            if self.dag.group(handle).is_frozen() {
                continue;
            }
            let producers = self.dag.producers(handle);
            let mut inputs_to_fuse: Option<(GroupHandle, GroupHandle)> = None;
            for i in 0..producers.len() {
                let first = producers[i];
                if !self.dag.contains(first) || self.dag.group(first).is_frozen() {
                    continue;
                }
                for &second in &producers[i + 1..] {
                    if !self.dag.contains(second) || self.dag.group(second).is_frozen() {
                        continue;
                    }
                    if !self.dag.has_cycle(first, second) && !self.dag.has_cycle(second, first) {
                        inputs_to_fuse = Some((first, second));
                        break;
                    }
                }
                if inputs_to_fuse.is_some() {
                    break;
                }
            }
            if let Some((first, second)) = inputs_to_fuse {
                self.dag.fuse_inputs(first, second);
            }
            if self.graph_size() <= self.ctx.min_graph_size {
                break;
            }
        }
        Ok(())
    }

    /// Discover and grow repeated blocks, then decide which ones to keep.
    pub fn repeated_blocks(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing repeated_blocks pass group");

        self.identify_uniques();
        self.repeat(Self::merge_uniques)?;
        self.merge_triangles()?;
        self.clean_up_uniques()?;

        log::info!("Number of groups after repeated_blocks: {}", self.graph_size());
        Ok(())
    }

    /// Seed repeat tokens: bucket groups by the structural descriptor of
    /// their initial node plus their avoided devices and special tags; every
    /// bucket with at least two members becomes a repeat class.
    pub fn identify_uniques(&mut self) {
        log::info!("Online partitioning: executing identify_uniques pass");

        let mut uniques: BTreeMap<(MetaDesc, BTreeSet<String>, Vec<String>), Vec<GroupHandle>> =
            BTreeMap::new();

        for handle in self.dag.sorted() {
            let group = self.dag.group(handle);
            let desc = self.model.meta_desc(group.get_initial_node());
            uniques
                .entry((
                    desc,
                    group.avoided_devices().clone(),
                    group.special_tags().to_vec(),
                ))
                .or_default()
                .push(handle);
        }

        for (_, bucket) in uniques {
            if bucket.len() > 1 {
                let rep = self.repeats.alloc();
                for handle in bucket {
                    self.dag.group_mut(handle).set_repeated(Some(rep));
                }
            }
        }
    }

    /// One growth sweep: for every cohort still open for merge, try to absorb
    /// a matching producer into every instance at once. A cohort that cannot
    /// grow at all is excluded from further sweeps.
    pub fn merge_uniques(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing merge_uniques pass");

        let mut merged_this_time: HashSet<RepeatId> = HashSet::new();

        let order = self.dag.sorted();
        for &handle in &order {
            if !self.dag.contains(handle) {
                continue;
            }
            let rep = self.dag.group(handle).repeated();

            let mut cohort: Vec<GroupHandle> = Vec::new();
            if let Some(tag) = rep
                && self.repeats.get(tag).open_for_merge()
                && !merged_this_time.contains(&tag)
            {
                for &other in &order {
                    if self.dag.contains(other) && self.dag.group(other).repeated() == Some(tag) {
                        cohort.push(other);
                    }
                }
            }

            if !cohort.is_empty()
                && let Some(new_rep) = self.try_grow_repeating_groups(&cohort)?
            {
                merged_this_time.insert(new_rep);
            }
        }

        log::debug!("Number of groups after merge_uniques: {}", self.graph_size());
        Ok(())
    }

    /// Try to grow every instance of one cohort by the same producer shape.
    /// Candidate producer/consumer pairs are bucketed by the canonical
    /// meta-interconnect of their boundary; bigger buckets are tried first,
    /// ties broken towards the tail of the model. Returns the fresh token on
    /// success; excludes the cohort's token and returns None when every
    /// bucket fails.
    fn try_grow_repeating_groups(
        &mut self,
        cohort: &[GroupHandle],
    ) -> Result<Option<RepeatId>, PartitionError> {
        let this_rep = self.dag.group(cohort[0]).repeated();
        let this_avoided = self.dag.group(cohort[0]).avoided_devices().clone();
        let this_special = self.dag.group(cohort[0]).special_tags().to_vec();

        // Merging from the tail of the model generalizes better for the
        // model families this targets; group ids are preserved in topological
        // order across the whole pipeline, which makes this a deterministic
        // tiebreak as well.
        let mut cohort_sorted = cohort.to_vec();
        cohort_sorted.sort_by(|&a, &b| {
            self.dag
                .group(b)
                .get_id()
                .cmp(&self.dag.group(a).get_id())
        });

        let mut mics: BTreeMap<Vec<MetaInterconnect>, Vec<(GroupHandle, GroupHandle)>> =
            BTreeMap::new();

        for &group in &cohort_sorted {
            for producer in self.dag.producers(group) {
                if !self.dag.contains(producer) {
                    continue;
                }
                let prod_group = self.dag.group(producer);
                if prod_group.repeated().is_some()
                    && prod_group.repeated() != this_rep
                    && !self.dag.has_cycle(producer, group)
                    && self.dag.group(producer).avoided_devices() == &this_avoided
                    && self.dag.group(producer).special_tags() == this_special.as_slice()
                {
                    let mut key = self.meta_interconnect(group, producer);
                    key.sort();
                    mics.entry(key).or_default().push((producer, group));
                }
            }
        }

        let mut mics_vec: Vec<Vec<(GroupHandle, GroupHandle)>> = mics.into_values().collect();
        mics_vec.sort_by(|a, b| {
            b.len().cmp(&a.len()).then_with(|| {
                let id_a = self.dag.group(a[0].0).get_id();
                let id_b = self.dag.group(b[0].0).get_id();
                id_b.cmp(&id_a)
            })
        });

        for mic in mics_vec {
            let (prods, conss): (Vec<GroupHandle>, Vec<GroupHandle>) = mic.into_iter().unzip();
            if let Some(new_rep) = self.try_merge_repeating(&prods, &conss)? {
                return Ok(Some(new_rep));
            }
        }

        // No merges happened at all: exclude this cohort from the procedure
        // and report it through the return value.
        if let Some(tag) = this_rep {
            self.repeats.get_mut(tag).exclude();
        }
        Ok(None)
    }

    /// Commit one parallel producer-into-consumer merge across a bucket of
    /// instance pairs, retagging every surviving consumer with a fresh token.
    /// Rejects buckets where a producer feeds several consumers of the class;
    /// those are triangles and belong to the triangle pass.
    fn try_merge_repeating(
        &mut self,
        prods: &[GroupHandle],
        conss: &[GroupHandle],
    ) -> Result<Option<RepeatId>, PartitionError> {
        if prods.len() != conss.len() {
            return Err(PartitionError::MergeVectorMismatch {
                prods: prods.len(),
                conss: conss.len(),
            });
        }

        if conss.len() == 1 {
            return Ok(None);
        }

        let prods_set: HashSet<GroupHandle> = prods.iter().copied().collect();
        if prods_set.len() != conss.len() {
            // A producer appears in several pairs, so this is a triangle
            // shape; deduplicating shrinks the list and the uniform-growth
            // requirement cannot hold here.
            return Ok(None);
        }

        for cons in conss {
            if prods.contains(cons) {
                return Err(PartitionError::OverlappingMerge);
            }
        }

        let new_rep = self.repeats.alloc();
        for i in 0..conss.len() {
            self.dag.fuse(conss[i], prods[i]);
            self.dag.group_mut(conss[i]).set_repeated(Some(new_rep));
        }

        for &cons in conss {
            for producer in self.dag.producers(cons) {
                if producer == cons {
                    return Err(PartitionError::PostMergeOverlap);
                }
            }
        }

        Ok(Some(new_rep))
    }

    /// Handle the configuration where one repeat-class producer feeds several
    /// consumers of another class at once:
    ///
    /// ```text
    ///   A1          A2          A3
    ///  / | \       / | \       / | \
    /// B1 B2 B3   B4 B5 B6   B7 B8 B9
    /// ```
    ///
    /// The uniform-growth pass rejects this shape because flattening the
    /// producer side yields `[A1, A1, A1, A2, ..]`, which deduplicates to a
    /// shorter list and fails its consistency check.
    pub fn merge_triangles(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing merge_triangles pass");

        let mut merged_this_time: HashSet<RepeatId> = HashSet::new();

        let order = self.dag.sorted();
        for &handle in &order {
            if !self.dag.contains(handle) {
                continue;
            }
            let group = self.dag.group(handle);
            let rep = group.repeated();
            let frozen = group.is_frozen();

            let mut cohort: Vec<GroupHandle> = Vec::new();
            if let Some(tag) = rep
                && !frozen
                && !merged_this_time.contains(&tag)
            {
                for &other in &order {
                    if self.dag.contains(other) {
                        let other_group = self.dag.group(other);
                        if other_group.repeated() == Some(tag) && !other_group.is_frozen() {
                            cohort.push(other);
                        }
                    }
                }
            }

            if !cohort.is_empty()
                && let Some(new_rep) = self.try_merge_triangle_cohort(&cohort)?
            {
                merged_this_time.insert(new_rep);
            }
        }

        log::debug!("Number of groups after merge_triangles: {}", self.graph_size());
        Ok(())
    }

    fn try_merge_triangle_cohort(
        &mut self,
        cohort: &[GroupHandle],
    ) -> Result<Option<RepeatId>, PartitionError> {
        if cohort.len() < 2 {
            return Ok(None);
        }

        let this_rep = self.dag.group(cohort[0]).repeated();
        let this_avoided = self.dag.group(cohort[0]).avoided_devices().clone();
        let this_special = self.dag.group(cohort[0]).special_tags().to_vec();

        let mut cohort_sorted = cohort.to_vec();
        cohort_sorted.sort_by(|&a, &b| {
            self.dag
                .group(b)
                .get_id()
                .cmp(&self.dag.group(a).get_id())
        });

        // mic key -> apex -> the bases that apex feeds over that boundary
        let mut mics: BTreeMap<
            Vec<MetaInterconnect>,
            BTreeMap<GroupHandle, BTreeSet<GroupHandle>>,
        > = BTreeMap::new();

        for &group in &cohort_sorted {
            for consumer in self.dag.consumers(group) {
                if !self.dag.contains(consumer) {
                    continue;
                }
                let cons_group = self.dag.group(consumer);
                if cons_group.repeated().is_some()
                    && cons_group.repeated() != this_rep
                    && !self.dag.has_cycle(group, consumer)
                    && self.dag.group(consumer).avoided_devices() == &this_avoided
                    && self.dag.group(consumer).special_tags() == this_special.as_slice()
                {
                    let mut key = self.meta_interconnect(consumer, group);
                    key.sort();
                    mics.entry(key)
                        .or_default()
                        .entry(group)
                        .or_default()
                        .insert(consumer);
                }
            }
        }

        let mut mics_vec: Vec<Vec<(GroupHandle, Vec<GroupHandle>)>> = Vec::new();
        for (_, triangle) in mics {
            let mut entry: Vec<(GroupHandle, Vec<GroupHandle>)> = triangle
                .into_iter()
                .map(|(apex, bases)| (apex, bases.into_iter().collect()))
                .collect();
            entry.sort_by(|a, b| {
                self.dag
                    .group(b.0)
                    .get_id()
                    .cmp(&self.dag.group(a.0).get_id())
            });
            mics_vec.push(entry);
        }

        mics_vec.sort_by(|a, b| {
            b.len().cmp(&a.len()).then_with(|| {
                self.dag
                    .group(b[0].0)
                    .get_id()
                    .cmp(&self.dag.group(a[0].0).get_id())
            })
        });

        for mic in mics_vec {
            let (apexes, bases): (Vec<GroupHandle>, Vec<Vec<GroupHandle>>) =
                mic.into_iter().unzip();
            if let Some(new_rep) = self.try_merge_triangles(&apexes, &bases)? {
                return Ok(Some(new_rep));
            }
        }

        // This pass ignores excluded cohorts, so nothing is excluded here
        // either.
        Ok(None)
    }

    /// Commit a triangle merge: each base is absorbed into its apex. Base
    /// positions are told apart by the second-order meta-interconnect between
    /// a base and its sole consumer; every second-order bucket retags the
    /// apexes with its own fresh token.
    fn try_merge_triangles(
        &mut self,
        apexes: &[GroupHandle],
        bases: &[Vec<GroupHandle>],
    ) -> Result<Option<RepeatId>, PartitionError> {
        if apexes.len() != bases.len() {
            return Err(PartitionError::TriangleVectorMismatch {
                prods: apexes.len(),
                conss: bases.len(),
            });
        }

        if apexes.len() < 2 {
            return Ok(None);
        }

        // Only the leaf-edge configuration is handled: every apex feeds the
        // same number of bases, and every base hangs off exactly one producer
        // and feeds exactly one consumer.
        for base in bases {
            if base.len() != bases[0].len() {
                return Ok(None);
            }
            for &element in base {
                if self.dag.consumers(element).len() != 1
                    || self.dag.producers(element).len() != 1
                {
                    return Ok(None);
                }
            }
        }

        let mut mic2: BTreeMap<Vec<MetaInterconnect>, Vec<GroupHandle>> = BTreeMap::new();
        for base in bases {
            for &element in base {
                let downstream = self.dag.consumers(element)[0];
                let mut key = self.meta_interconnect(downstream, element);
                key.sort();
                mic2.entry(key).or_default().push(element);
            }
        }

        if mic2.len() != bases[0].len() {
            return Err(PartitionError::SecondOrderInterconnectMismatch {
                got: mic2.len(),
                expected: bases[0].len(),
            });
        }

        let mut base_to_apex: HashMap<GroupHandle, GroupHandle> = HashMap::new();
        for (i, base) in bases.iter().enumerate() {
            for &element in base {
                base_to_apex.insert(element, apexes[i]);
            }
        }

        let mut new_rep = None;
        for (_, same_bases) in mic2 {
            let rep = self.repeats.alloc();
            for base in same_bases {
                let apex = base_to_apex[&base];
                self.dag.fuse_with(apex, base);
                self.dag.group_mut(apex).set_repeated(Some(rep));
            }
            new_rep = Some(rep);
        }

        Ok(new_rep)
    }

    fn repeating(&self) -> BTreeMap<RepeatId, Vec<GroupHandle>> {
        let mut repeating: BTreeMap<RepeatId, Vec<GroupHandle>> = BTreeMap::new();
        for handle in self.dag.sorted() {
            if let Some(rep) = self.dag.group(handle).repeated() {
                repeating.entry(rep).or_default().push(handle);
            }
        }
        repeating
    }

    /// Decide which repeat classes survive, freeze the kept ones, and publish
    /// their layer-match tables. Classes carrying avoids or no-fold flags are
    /// always kept; the rest must clear the keep thresholds.
    pub fn clean_up_uniques(&mut self) -> Result<(), PartitionError> {
        log::info!("Online partitioning: executing clean_up_uniques pass");

        for (rep, gset) in self.repeating() {
            if !self.clean_up_uniques_impl(&gset) {
                continue;
            }
            self.complete_repeating(rep, &gset)?;
        }

        self.after_uniques();

        log::debug!("Number of groups after clean_up_uniques: {}", self.graph_size());
        Ok(())
    }

    fn clean_up_uniques_impl(&mut self, gset: &[GroupHandle]) -> bool {
        let block_layer_size = self.dag.group(gset[0]).size();

        let has_flags = gset.iter().any(|&handle| {
            let group = self.dag.group(handle);
            !group.avoided_devices().is_empty() || group.is_no_fold()
        });
        if has_flags {
            log::debug!(
                "Keeping a repeated block of {} groups with {} layers - has avoids",
                gset.len(),
                block_layer_size
            );
            for &handle in gset {
                self.dag.group_mut(handle).freeze();
            }
            return true;
        }

        if gset.len() >= self.ctx.keep_blocks && block_layer_size >= self.ctx.keep_block_size {
            log::debug!(
                "Keeping a repeated block of {} groups with {} layers",
                gset.len(),
                block_layer_size
            );
            for &handle in gset {
                self.dag.group_mut(handle).freeze();
            }
            return true;
        }

        for &handle in gset {
            self.dag.group_mut(handle).set_repeated(None);
        }
        log::debug!(
            "Repeated block of {} groups with {} layers is dropped",
            gset.len(),
            block_layer_size
        );
        false
    }

    /// Match corresponding layers across the instances of one kept repeat
    /// class. Every archetype must occur exactly once per instance, and the
    /// archetype count must equal every instance's layer count; anything else
    /// is a fatal mismatch.
    fn complete_repeating(
        &mut self,
        rep: RepeatId,
        gset: &[GroupHandle],
    ) -> Result<(), PartitionError> {
        let mut matches: BTreeMap<Archetype, BTreeSet<OpNodeId>> = BTreeMap::new();

        for &handle in gset {
            let group = self.dag.group(handle);
            for &layer in group.get_content() {
                let archetype = Archetype {
                    desc: self.model.meta_desc(layer),
                    reptrack: group.get_reptrack(layer).to_vec(),
                };
                matches.entry(archetype).or_default().insert(layer);
            }
        }

        for node_set in matches.values() {
            if node_set.len() != gset.len() {
                return Err(PartitionError::ArchetypeInstanceMismatch {
                    got: node_set.len(),
                    expected: gset.len(),
                });
            }
        }
        for &handle in gset {
            let content_size = self.dag.group(handle).size();
            if matches.len() != content_size {
                return Err(PartitionError::ArchetypeCountMismatch {
                    got: matches.len(),
                    expected: content_size,
                });
            }
        }

        self.repeats
            .get_mut(rep)
            .set_archetypes(matches.keys().cloned().collect());

        let layer_matches: Vec<BTreeSet<String>> = matches
            .values()
            .map(|node_set| {
                node_set
                    .iter()
                    .map(|&layer| self.model.node(layer).name.clone())
                    .collect()
            })
            .collect();
        self.matches
            .insert(self.repeats.repeated_id(rep), layer_matches);
        Ok(())
    }

    fn after_uniques(&mut self) {
        log::info!("Online partitioning: executing after_uniques pass");

        for handle in self.dag.sorted() {
            let tag = self
                .dag
                .group(handle)
                .isolated_tag()
                .map(|tag| tag.to_string());
            // Not expecting thousands of tags, so a linear scan is enough
            if let Some(tag) = tag
                && self.ctx.nofolds.contains(&tag)
            {
                self.dag.group_mut(handle).set_no_fold();
            }
        }
    }

    /// Every operation-level edge crossing from `producer` into `consumer`,
    /// described at the port-metadata level. Callers sort the result before
    /// using it as a key.
    fn meta_interconnect(
        &self,
        consumer: GroupHandle,
        producer: GroupHandle,
    ) -> Vec<MetaInterconnect> {
        let mut interconnect = Vec::new();
        let cons_content = self.dag.group(consumer).get_content();
        for &src in self.dag.group(producer).get_content() {
            let Some((_, readers)) = self.node_to_prod_cons.get(&src) else {
                continue;
            };
            for &dst in readers {
                if !cons_content.contains(&dst) {
                    continue;
                }
                if let Some(&(src_port, dst_port)) = self.ports_map.get(&(src, dst)) {
                    interconnect.push(MetaInterconnect {
                        src_desc: self.model.meta_desc(src),
                        src_port,
                        dst_port,
                        dst_desc: self.model.meta_desc(dst),
                    });
                }
            }
        }
        interconnect
    }

    /// Run a pass until the group count stops changing or the graph is
    /// already at the minimum size. The size gate fires before the first
    /// iteration, so a small enough graph never runs the pass at all.
    pub fn repeat<F>(&mut self, mut pass: F) -> Result<(), PartitionError>
    where
        F: FnMut(&mut Self) -> Result<(), PartitionError>,
    {
        let mut prev_graph_size = 0usize;
        let mut curr_graph_size = self.graph_size();

        while self.graph_size() > self.ctx.min_graph_size && curr_graph_size != prev_graph_size {
            prev_graph_size = self.graph_size();
            pass(self)?;
            curr_graph_size = self.graph_size();
        }

        log::debug!("Number of groups after pass: {}", self.graph_size());
        Ok(())
    }

    pub fn graph_size(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_operational(&self, node: OpNodeId) -> bool {
        is_op(&self.model, node)
    }

    pub fn get_graph(&self) -> &GroupDag {
        &self.dag
    }

    pub fn get_graph_mut(&mut self) -> &mut GroupDag {
        &mut self.dag
    }

    pub fn get_model(&self) -> &OpGraph {
        &self.model
    }

    pub fn get_group_of(&self, node: OpNodeId) -> Option<GroupHandle> {
        self.dag.get_group_of(node)
    }

    pub fn get_node_producers(&self, node: OpNodeId) -> Option<&BTreeSet<OpNodeId>> {
        self.node_to_prod_cons.get(&node).map(|(prods, _)| prods)
    }

    pub fn get_node_consumers(&self, node: OpNodeId) -> Option<&BTreeSet<OpNodeId>> {
        self.node_to_prod_cons.get(&node).map(|(_, conss)| conss)
    }

    pub fn get_ports_map(&self) -> &PortsMap {
        &self.ports_map
    }

    pub fn get_matches(&self) -> &LayerMatches {
        &self.matches
    }

    pub fn get_repeat(&self, id: RepeatId) -> &Repeated {
        self.repeats.get(id)
    }
}
