//! Device independent planning for bottom-level acceleration structure builds.
//!
//! The Vulkan side lives in [`crate::vulkan::acceleration_structure`]; this module
//! decides how the inputs are split into batches and tracks where every BLAS is in
//! its build.

use std::ops::Range;

/// Upper bound for the acceleration structure memory built in one go.
pub const DEFAULT_BATCH_BUDGET: u64 = 256 * 1024 * 1024;

/// What the device reported for one input, plus whether it may be compacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasSizes {
    pub structure_size: u64,
    pub scratch_size: u64,
    pub allow_compaction: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlasState {
    Pending,
    Batched { batch: usize },
    Built,
    QueryingSize,
    Compacting,
    Compacted,
    Ready,
}

impl BlasState {
    fn can_transition_to(self, next: BlasState, compact: bool) -> bool {
        use BlasState::*;
        match (self, next) {
            (Pending, Batched { .. }) => true,
            (Batched { .. }, Built) => true,
            (Built, QueryingSize) => compact,
            (Built, Ready) => !compact,
            (QueryingSize, Compacting) => true,
            (Compacting, Compacted) => true,
            (Compacted, Ready) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlasBatch {
    /// Indices into the input list, in input order.
    pub range: Range<usize>,
    /// Largest scratch requirement in the batch. One scratch buffer of this size is
    /// shared by all builds of the batch.
    pub scratch_size: u64,
    pub structure_size: u64,
}

#[derive(Debug, Clone)]
pub struct BlasBuildPlan {
    batches: Vec<BlasBatch>,
    states: Vec<BlasState>,
    compact: bool,
}

impl BlasBuildPlan {
    /// Splits `inputs` into batches.
    ///
    /// Structure sizes are summed in input order and a batch is closed as soon as
    /// the running total reaches `budget`, or at the last input. Either every input
    /// allows compaction or none does.
    pub fn new(inputs: &[BlasSizes], budget: u64) -> Self {
        let compacting = inputs.iter().filter(|i| i.allow_compaction).count();
        assert!(
            compacting == 0 || compacting == inputs.len(),
            "Compaction must be requested for every BLAS of a build or for none ({} of {})",
            compacting,
            inputs.len()
        );
        let compact = !inputs.is_empty() && compacting == inputs.len();

        let mut batches = Vec::new();
        let mut states = vec![BlasState::Pending; inputs.len()];
        let mut start = 0;
        let mut structure_size = 0u64;
        let mut scratch_size = 0u64;

        for (index, input) in inputs.iter().enumerate() {
            structure_size += input.structure_size;
            scratch_size = scratch_size.max(input.scratch_size);

            if structure_size >= budget || index == inputs.len() - 1 {
                let batch = batches.len();
                for state in &mut states[start..=index] {
                    state.transition(BlasState::Batched { batch }, compact);
                }
                batches.push(BlasBatch {
                    range: start..index + 1,
                    scratch_size,
                    structure_size,
                });
                start = index + 1;
                structure_size = 0;
                scratch_size = 0;
            }
        }

        Self {
            batches,
            states,
            compact,
        }
    }

    pub fn batches(&self) -> &[BlasBatch] {
        &self.batches
    }

    pub fn compact(&self) -> bool {
        self.compact
    }

    pub fn state(&self, index: usize) -> BlasState {
        self.states[index]
    }

    pub fn advance(&mut self, index: usize, next: BlasState) {
        let compact = self.compact;
        self.states[index].transition(next, compact);
    }

    /// Moves a built BLAS to the state it should be in after its batch finished:
    /// `QueryingSize` when compacting, otherwise `Ready`.
    pub fn finish_build(&mut self, index: usize) {
        self.advance(index, BlasState::Built);
        if self.compact {
            self.advance(index, BlasState::QueryingSize);
        } else {
            self.advance(index, BlasState::Ready);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.states.iter().all(|s| *s == BlasState::Ready)
    }
}

impl BlasState {
    fn transition(&mut self, next: BlasState, compact: bool) {
        assert!(
            self.can_transition_to(next, compact),
            "Illegal BLAS transition {:?} -> {:?} (compaction: {})",
            self,
            next,
            compact
        );
        *self = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn sizes(structure_mib: u64) -> BlasSizes {
        BlasSizes {
            structure_size: structure_mib * MIB,
            scratch_size: structure_mib * MIB / 2,
            allow_compaction: false,
        }
    }

    #[test]
    fn small_inputs_share_one_batch() {
        let plan = BlasBuildPlan::new(&[sizes(10), sizes(20), sizes(30)], DEFAULT_BATCH_BUDGET);
        assert_eq!(plan.batches().len(), 1);
        assert_eq!(plan.batches()[0].range, 0..3);
        assert_eq!(plan.batches()[0].scratch_size, 15 * MIB);
        for index in 0..3 {
            assert_eq!(plan.state(index), BlasState::Batched { batch: 0 });
        }
    }

    #[test]
    fn huge_input_closes_its_batch() {
        let plan = BlasBuildPlan::new(&[sizes(10), sizes(300), sizes(30)], DEFAULT_BATCH_BUDGET);
        let ranges: Vec<_> = plan.batches().iter().map(|b| b.range.clone()).collect();
        assert_eq!(ranges, vec![0..2, 2..3]);
        assert_eq!(plan.batches()[0].scratch_size, 150 * MIB);
        assert_eq!(plan.batches()[1].scratch_size, 15 * MIB);
    }

    #[test]
    fn batch_count_is_at_least_total_over_budget() {
        let inputs = vec![sizes(100); 5];
        let plan = BlasBuildPlan::new(&inputs, DEFAULT_BATCH_BUDGET);
        let total: u64 = inputs.iter().map(|i| i.structure_size).sum();
        let minimum = (total + DEFAULT_BATCH_BUDGET - 1) / DEFAULT_BATCH_BUDGET;
        assert!(plan.batches().len() as u64 >= minimum);
        assert_eq!(plan.batches().len(), 2);

        let covered: Vec<usize> = plan.batches().iter().flat_map(|b| b.range.clone()).collect();
        assert_eq!(covered, (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn no_inputs_means_no_batches() {
        let plan = BlasBuildPlan::new(&[], DEFAULT_BATCH_BUDGET);
        assert!(plan.batches().is_empty());
        assert!(plan.is_ready());
    }

    #[test]
    #[should_panic(expected = "Compaction must be requested")]
    fn mixed_compaction_is_rejected() {
        let mut compactable = sizes(1);
        compactable.allow_compaction = true;
        BlasBuildPlan::new(&[compactable, sizes(1)], DEFAULT_BATCH_BUDGET);
    }

    #[test]
    fn compacted_blas_walks_every_state() {
        let mut compactable = sizes(1);
        compactable.allow_compaction = true;
        let mut plan = BlasBuildPlan::new(&[compactable], DEFAULT_BATCH_BUDGET);
        assert!(plan.compact());

        plan.finish_build(0);
        assert_eq!(plan.state(0), BlasState::QueryingSize);
        plan.advance(0, BlasState::Compacting);
        plan.advance(0, BlasState::Compacted);
        assert!(!plan.is_ready());
        plan.advance(0, BlasState::Ready);
        assert!(plan.is_ready());
    }

    #[test]
    fn uncompacted_blas_is_ready_after_build() {
        let mut plan = BlasBuildPlan::new(&[sizes(1), sizes(2)], DEFAULT_BATCH_BUDGET);
        plan.finish_build(0);
        plan.finish_build(1);
        assert!(plan.is_ready());
    }

    #[test]
    #[should_panic(expected = "Illegal BLAS transition")]
    fn uncompacted_blas_cannot_be_compacted() {
        let mut plan = BlasBuildPlan::new(&[sizes(1)], DEFAULT_BATCH_BUDGET);
        plan.advance(0, BlasState::Built);
        plan.advance(0, BlasState::QueryingSize);
    }
}
