//! Property tests for the routing label codec
//!
//! Any label built from a valid destination id and a non-empty metric name
//! must decode back to itself.

use cloudwatch_forwarder::label::{Destination, Label};
use proptest::prelude::*;

fn destination() -> impl Strategy<Value = Destination> {
    prop_oneof![
        "[^:]{1,20}".prop_map(Destination::Service),
        "[^:]{1,20}".prop_map(Destination::Host),
    ]
}

proptest! {
    #[test]
    fn decode_inverts_encode(destination in destination(), metric in ".{1,30}") {
        let label = Label::new(destination, metric).expect("valid label");
        let decoded = Label::decode(&label.encode()).expect("encoded label should decode");
        prop_assert_eq!(decoded, label);
    }

    #[test]
    fn decode_never_panics(input in ".{0,60}") {
        let _ = Label::decode(&input);
    }

    #[test]
    fn ids_with_colon_are_rejected(prefix in "[^:]{0,5}", suffix in "[^:]{0,5}") {
        let id = format!("{}:{}", prefix, suffix);
        prop_assert!(Label::service(id, "metric").is_err());
    }
}

#[test]
fn rejects_malformed_labels() {
    for input in [
        "",
        "no-separator",
        ":metric",
        "service=svc:",
        "svc:metric",
        "=svc:metric",
        "service=:metric",
        "queue=svc:metric",
    ] {
        assert!(Label::decode(input).is_err(), "{:?} should be rejected", input);
    }
}

#[test]
fn metric_name_may_contain_colons() {
    let label = Label::decode("host=h-1:custom.a:b").unwrap();
    assert_eq!(label.destination(), &Destination::Host("h-1".to_string()));
    assert_eq!(label.metric_name(), "custom.a:b");
}
