use unnamed_engine::accel::{BlasBuildPlan, BlasSizes, BlasState, DEFAULT_BATCH_BUDGET};

fn blas(structure_size: u64, scratch_size: u64) -> BlasSizes {
    BlasSizes {
        structure_size,
        scratch_size,
        allow_compaction: false,
    }
}

fn ranges(plan: &BlasBuildPlan) -> Vec<std::ops::Range<usize>> {
    plan.batches().iter().map(|b| b.range.clone()).collect()
}

#[test]
fn reaching_the_budget_exactly_closes_the_batch() {
    let plan = BlasBuildPlan::new(&[blas(60, 1), blas(40, 1), blas(10, 1)], 100);
    assert_eq!(ranges(&plan), vec![0..2, 2..3]);
    assert_eq!(plan.batches()[0].structure_size, 100);
    assert_eq!(plan.batches()[1].structure_size, 10);
}

#[test]
fn batches_are_contiguous_and_keep_input_order() {
    let inputs: Vec<_> = (1..=9u64).map(|i| blas(i * 10, i)).collect();
    let plan = BlasBuildPlan::new(&inputs, 100);

    let mut expected_start = 0;
    for batch in plan.batches() {
        assert_eq!(batch.range.start, expected_start);
        assert!(!batch.range.is_empty());
        let sum: u64 = inputs[batch.range.clone()]
            .iter()
            .map(|i| i.structure_size)
            .sum();
        assert_eq!(batch.structure_size, sum);
        let max_scratch = inputs[batch.range.clone()]
            .iter()
            .map(|i| i.scratch_size)
            .max()
            .unwrap();
        assert_eq!(batch.scratch_size, max_scratch);
        expected_start = batch.range.end;
    }
    assert_eq!(expected_start, inputs.len());
    // 10+20+30+40 | 50+60 | 70+80 | 90
    assert_eq!(ranges(&plan), vec![0..4, 4..6, 6..8, 8..9]);
}

#[test]
fn a_single_oversized_input_gets_its_own_batch() {
    let plan = BlasBuildPlan::new(
        &[blas(1, 1), blas(2 * DEFAULT_BATCH_BUDGET, 1), blas(1, 1)],
        DEFAULT_BATCH_BUDGET,
    );
    assert_eq!(ranges(&plan), vec![0..2, 2..3]);
}

#[test]
fn every_input_is_assigned_to_its_batch() {
    let plan = BlasBuildPlan::new(&[blas(80, 1), blas(80, 1), blas(80, 1)], 100);
    assert_eq!(plan.state(0), BlasState::Batched { batch: 0 });
    assert_eq!(plan.state(1), BlasState::Batched { batch: 0 });
    assert_eq!(plan.state(2), BlasState::Batched { batch: 1 });
    assert!(!plan.compact());
}

#[test]
fn compacted_plan_is_ready_only_after_every_blas_was_copied() {
    let inputs: Vec<_> = (0..3)
        .map(|_| BlasSizes {
            allow_compaction: true,
            ..blas(10, 5)
        })
        .collect();
    let mut plan = BlasBuildPlan::new(&inputs, DEFAULT_BATCH_BUDGET);
    assert!(plan.compact());

    for index in 0..3 {
        plan.finish_build(index);
    }
    for index in 0..3 {
        plan.advance(index, BlasState::Compacting);
        plan.advance(index, BlasState::Compacted);
    }
    assert!(!plan.is_ready());
    for index in 0..3 {
        plan.advance(index, BlasState::Ready);
    }
    assert!(plan.is_ready());
}

#[test]
#[should_panic(expected = "Illegal BLAS transition")]
fn compacted_blas_cannot_skip_the_copy() {
    let mut plan = BlasBuildPlan::new(
        &[BlasSizes {
            allow_compaction: true,
            ..blas(10, 5)
        }],
        DEFAULT_BATCH_BUDGET,
    );
    plan.advance(0, BlasState::Built);
    plan.advance(0, BlasState::Ready);
}
