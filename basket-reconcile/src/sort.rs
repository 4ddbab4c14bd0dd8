//! Result ordering.

use std::cmp::Ordering;

use basket_core::ProductRecord;

/// Sort by ascending known price. Records without a usable price follow the
/// priced ones, and records tagged `removed` go last. The sort is stable, so
/// unpriced records keep their relative order.
pub fn sort_by_price(records: &mut [ProductRecord]) {
    records.sort_by(compare);
}

fn compare(a: &ProductRecord, b: &ProductRecord) -> Ordering {
    a.removed.cmp(&b.removed).then_with(|| {
        match (a.known_price(), b.known_price()) {
            (Some(pa), Some(pb)) => pa.cmp(&pb),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    })
}
