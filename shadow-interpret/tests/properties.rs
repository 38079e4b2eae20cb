//! Concrete runs of instrumented programs. Every run that satisfies the
//! emitted assumptions must pass every emitted assertion.

use proptest::prelude::*;
use shadow_ast::Program;
use shadow_core::{Ratio, TransformOptions, transform_program};
use shadow_interpret::{Interpreter, Outcome, Queue, Value};

const NOISYMAX: &str = include_str!("../../shadow-core/tests/fixtures/noisymax.c");
const NOISYMAX_LOCAL: &str = include_str!("../../shadow-core/tests/fixtures/noisymax_local.c");
const SPARSEVECTOR_N: &str = include_str!("../../shadow-core/tests/fixtures/sparsevectorN.c");
const PREFIXSUM: &str = include_str!("../../shadow-core/tests/fixtures/prefixsum.c");
const SMARTSUM: &str = include_str!("../../shadow-core/tests/fixtures/smartsum.c");

const V_EPSILON: &str = "__SHADOWDP_v_epsilon";

fn instrumented(src: &str, options: &TransformOptions) -> Program {
    let program = shadow_parse::parse_source(src).unwrap();
    transform_program(&program, options).unwrap().0
}

fn floats(items: &[i128]) -> Value {
    Value::array(items.iter().copied())
}

fn half(n: i128, d: i128) -> Ratio {
    Ratio::new(n, d).unwrap()
}

#[test]
fn noisymax_concrete_scenario() {
    let program = instrumented(NOISYMAX, &TransformOptions::default());
    let interp = Interpreter::new(&program);
    let dist = [1, -1, 1];
    let args = vec![Value::float(1), Value::Int(3), floats(&[1, 5, 3]), floats(&dist), floats(&dist)];
    let run = interp.call("noisymax", args, &mut Queue::new([0, 0, 0])).unwrap();
    assert_eq!(run.outcome, Outcome::Returned(Some(Value::Int(1))));
    assert_eq!(run.var(V_EPSILON), Some(&Value::float(1)));
    assert_eq!(run.var("__SHADOWDP_ALIGNED_DISTANCE_bq"), Some(&Value::float(dist[1] + 2)));
}

#[test]
fn all_differ_prunes_out_of_range_distances() {
    let program = instrumented(NOISYMAX, &TransformOptions::default());
    let interp = Interpreter::new(&program);

    let too_far = vec![Value::float(1), Value::Int(2), floats(&[1, 2]), floats(&[2, 0]), floats(&[2, 0])];
    assert!(interp.call("noisymax", too_far, &mut Queue::new([0, 0])).unwrap().is_pruned());

    let split = vec![Value::float(1), Value::Int(2), floats(&[1, 2]), floats(&[1, 0]), floats(&[0, 0])];
    assert!(interp.call("noisymax", split, &mut Queue::new([0, 0])).unwrap().is_pruned());
}

#[test]
fn sparse_vector_spends_half_on_the_threshold_and_half_on_the_answer() {
    let program = instrumented(SPARSEVECTOR_N, &TransformOptions::default());
    let interp = Interpreter::new(&program);
    let dist = [1, 1, -1, 0];
    let args = vec![
        Value::float(1),
        Value::Int(4),
        floats(&[0, 9, 0, 9]),
        Value::float(5),
        Value::Int(1),
        floats(&dist),
        floats(&dist),
    ];
    let run = interp.call("sparsevectorN", args, &mut Queue::new([0, 0, 0, 0, 0])).unwrap();
    assert!(run.holds(), "{:?}", run.outcome);
    assert_eq!(run.var("count"), Some(&Value::Int(1)));
    assert_eq!(run.var(V_EPSILON), Some(&Value::float(1)));
}

#[test]
fn one_differ_charges_only_at_the_differing_index() {
    let program = instrumented(PREFIXSUM, &TransformOptions::default());
    let interp = Interpreter::new(&program);
    let size = 5usize;
    for index in 0..size {
        for sign in [-1, 1] {
            let mut dist = vec![0; size];
            dist[index] = sign;
            let args = vec![
                Value::float(1),
                Value::Int(size as i128),
                floats(&[3, 1, 4, 1, 5]),
                Value::float(size as i128),
                Value::Int(index as i128),
                floats(&dist),
                floats(&dist),
            ];
            let run = interp.call("prefixsum", args, &mut Queue::new([0; 5])).unwrap();
            assert_eq!(run.outcome, Outcome::Returned(None), "index {index}");
            assert_eq!(run.var(V_EPSILON), Some(&Value::float(1)), "index {index}");
        }
    }
}

#[test]
fn one_differ_prunes_a_second_differing_element() {
    let program = instrumented(PREFIXSUM, &TransformOptions::default());
    let interp = Interpreter::new(&program);
    let dist = [1, 0, 1];
    let args = vec![
        Value::float(1),
        Value::Int(3),
        floats(&[1, 2, 3]),
        Value::float(3),
        Value::Int(0),
        floats(&dist),
        floats(&dist),
    ];
    assert!(interp.call("prefixsum", args, &mut Queue::new([0; 3])).unwrap().is_pruned());
}

#[test]
fn smartsum_stays_within_twice_epsilon() {
    let options = TransformOptions {
        goal: Some(Ratio::integer(2)),
        ..TransformOptions::default()
    };
    let program = instrumented(SMARTSUM, &options);
    let interp = Interpreter::new(&program);
    let size = 6usize;
    for index in 0..size {
        let mut dist = vec![0; size];
        dist[index] = 1;
        let args = vec![
            Value::float(1),
            Value::Int(size as i128),
            floats(&[2, 7, 1, 8, 2, 8]),
            Value::float(size as i128),
            Value::Int(2),
            Value::Int(index as i128),
            floats(&dist),
            floats(&dist),
        ];
        let run = interp.call("smartsum", args, &mut Queue::new([0; 6])).unwrap();
        assert!(run.holds(), "index {index}: {:?}", run.outcome);
        assert!(!run.is_pruned(), "index {index}");
    }
}

proptest! {
    #[test]
    fn noisymax_assertions_hold_on_aligned_inputs(
        cases in proptest::collection::vec((0i128..10, -1i128..=1, -4i128..4), 1..6),
    ) {
        let program = instrumented(NOISYMAX, &TransformOptions::default());
        let interp = Interpreter::new(&program);
        let q: Vec<i128> = cases.iter().map(|c| c.0).collect();
        let dist: Vec<i128> = cases.iter().map(|c| c.1).collect();
        let mut noise = Queue::new(cases.iter().map(|c| c.2));
        let args = vec![
            Value::float(1),
            Value::Int(q.len() as i128),
            floats(&q),
            floats(&dist),
            floats(&dist),
        ];
        let run = interp.call("noisymax", args, &mut noise).unwrap();
        prop_assert!(run.holds(), "{:?}", run.outcome);
        prop_assert!(!run.is_pruned());
    }

    #[test]
    fn sparse_vector_budget_is_bounded_by_the_answer_count(
        nn in prop::sample::select(vec![1i128, 2, 5]),
        cases in proptest::collection::vec((0i128..10, -1i128..=1, -3i128..3), 1..8),
        threshold in 0i128..10,
        threshold_noise in -2i128..2,
    ) {
        let program = instrumented(SPARSEVECTOR_N, &TransformOptions::default());
        let interp = Interpreter::new(&program);
        let q: Vec<i128> = cases.iter().map(|c| c.0).collect();
        let dist: Vec<i128> = cases.iter().map(|c| c.1).collect();
        let mut noise = Queue::new(std::iter::once(threshold_noise).chain(cases.iter().map(|c| c.2)));
        let args = vec![
            Value::float(1),
            Value::Int(q.len() as i128),
            floats(&q),
            Value::float(threshold),
            Value::Int(nn),
            floats(&dist),
            floats(&dist),
        ];
        let run = interp.call("sparsevectorN", args, &mut noise).unwrap();
        prop_assert!(run.holds(), "{:?}", run.outcome);

        let Some(Value::Int(count)) = run.var("count") else {
            panic!("count missing from {:?}", run.vars);
        };
        prop_assert!(*count <= nn);
        let spent = half(1, 2).checked_add(half(*count, 2 * nn)).unwrap();
        prop_assert_eq!(run.var(V_EPSILON), Some(&Value::Float(spent)));
    }
}

proptest! {
    #[test]
    fn arm_local_temporaries_do_not_change_noisymax(
        cases in proptest::collection::vec((0i128..10, -1i128..=1, -4i128..4), 1..6),
    ) {
        let q: Vec<i128> = cases.iter().map(|c| c.0).collect();
        let dist: Vec<i128> = cases.iter().map(|c| c.1).collect();
        let args = || vec![
            Value::float(1),
            Value::Int(q.len() as i128),
            floats(&q),
            floats(&dist),
            floats(&dist),
        ];
        let noise = || Queue::new(cases.iter().map(|c| c.2));

        let direct = instrumented(NOISYMAX, &TransformOptions::default());
        let local = instrumented(NOISYMAX_LOCAL, &TransformOptions::default());
        let expected = Interpreter::new(&direct).call("noisymax", args(), &mut noise()).unwrap();
        let run = Interpreter::new(&local).call("noisymax", args(), &mut noise()).unwrap();
        prop_assert!(run.holds(), "{:?}", run.outcome);
        prop_assert_eq!(&run.outcome, &expected.outcome);
        for var in [V_EPSILON, "__SHADOWDP_ALIGNED_DISTANCE_bq", "__SHADOWDP_SHADOW_DISTANCE_bq"] {
            prop_assert_eq!(run.var(var), expected.var(var), "{}", var);
        }
    }

    #[test]
    fn numeric_sparse_vector_answers_stay_within_budget(
        nn in 1i128..4,
        cases in proptest::collection::vec((0i128..10, -1i128..=1, -3i128..3, -3i128..3), 1..8),
        threshold in 0i128..10,
        threshold_noise in -2i128..2,
    ) {
        let program = instrumented(
            include_str!("../../shadow-core/tests/fixtures/numsparsevectorN.c"),
            &TransformOptions::default(),
        );
        let interp = Interpreter::new(&program);
        let q: Vec<i128> = cases.iter().map(|c| c.0).collect();
        let dist: Vec<i128> = cases.iter().map(|c| c.1).collect();
        let draws = cases.iter().flat_map(|c| [c.2, c.3]);
        let mut noise = Queue::new(std::iter::once(threshold_noise).chain(draws));
        let args = vec![
            Value::float(1),
            Value::Int(q.len() as i128),
            floats(&q),
            Value::float(threshold),
            Value::Int(nn),
            floats(&dist),
            floats(&dist),
        ];
        let run = interp.call("numsparsevectorN", args, &mut noise).unwrap();
        prop_assert!(run.holds(), "{:?}", run.outcome);
        prop_assert!(!run.is_pruned());

        let spent = run.var(V_EPSILON).and_then(Value::as_ratio).unwrap();
        prop_assert!(spent <= Ratio::ONE, "spent {}", spent);
    }
}
