/// A batch may not exceed this serialized size.
pub const MAX_BATCH_BYTES: usize = 50 * 1024;
/// Nor this many objects.
pub const MAX_BATCH_OBJECTS: usize = 5_000;

/// Pack `objects` into submission batches, greedily filling each batch up
/// to the byte and count limits and spilling the remainder. An object
/// which alone exceeds the byte limit still forms its own batch.
pub fn partition(objects: &[String]) -> Vec<Vec<String>> {
    let mut batches = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_bytes = 2; // Array brackets.

    for object in objects {
        let cost = object.len() + 3;
        let over_bytes = current_bytes + cost > MAX_BATCH_BYTES;
        let over_count = current.len() >= MAX_BATCH_OBJECTS;

        if !current.is_empty() && (over_bytes || over_count) {
            batches.push(std::mem::take(&mut current));
            current_bytes = 2;
        }
        current_bytes += cost;
        current.push(object.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::estimated_bytes;

    #[test]
    fn everything_fits_in_one_batch() {
        let objects: Vec<String> = (0..10).map(|i| format!("https://example.net/{i}")).collect();
        let batches = partition(&objects);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], objects);
    }

    #[test]
    fn twelve_thousand_urls_split_within_both_limits() {
        let objects: Vec<String> = (0..12_000)
            .map(|i| format!("https://www.example.net/p/{i:030}"))
            .collect();

        let batches = partition(&objects);
        assert!(batches.len() >= 3, "got {} batches", batches.len());

        let mut total = 0;
        for batch in &batches {
            assert!(batch.len() <= MAX_BATCH_OBJECTS);
            assert!(estimated_bytes(batch) <= MAX_BATCH_BYTES);
            total += batch.len();
        }
        assert_eq!(total, 12_000);

        // Order is preserved across the split.
        assert_eq!(batches[0][0], objects[0]);
        assert_eq!(batches.last().unwrap().last().unwrap(), objects.last().unwrap());
    }

    #[test]
    fn object_count_caps_a_batch() {
        let objects: Vec<String> = (0..6_000).map(|i| format!("{i}")).collect();
        let batches = partition(&objects);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), MAX_BATCH_OBJECTS);
        assert_eq!(batches[1].len(), 1_000);
    }

    #[test]
    fn an_oversized_object_is_a_singleton_batch() {
        let huge = "x".repeat(MAX_BATCH_BYTES * 2);
        let objects = vec!["small".to_string(), huge.clone(), "also-small".to_string()];

        let batches = partition(&objects);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec!["small".to_string()]);
        assert_eq!(batches[1], vec![huge]);
        assert_eq!(batches[2], vec!["also-small".to_string()]);
    }

    #[test]
    fn empty_input_produces_no_batches() {
        assert!(partition(&[]).is_empty());
    }
}
