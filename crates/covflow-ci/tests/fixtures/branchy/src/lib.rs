pub fn classify(n: i64) -> &'static str {
    if n >= 0 {
        "non-negative"
    } else {
        "negative"
    }
}
