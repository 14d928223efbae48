#[test]
fn positive() {
    assert_eq!(branchy::classify(3), "non-negative");
}
