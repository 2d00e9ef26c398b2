use crate::models::{MetricRecord, WorkerCursor};
use std::collections::BTreeMap;

/// Canonical group visiting order. Groups absent from the dataset are
/// skipped; groups the editor invents land after these, alphabetically.
pub const GROUP_TRAVERSAL_ORDER: [&str; 10] = [
    "Key Metrics",
    "Site Distribution",
    "Accounts",
    "Customer Metrics",
    "Historical Data",
    "Inventory",
    "POR Overview",
    "Daily Orders",
    "AR Aging",
    "Web Orders",
];

/// The one chart group whose query returns multiple category rows fanned out
/// across the group's records.
pub const AGGREGATED_GROUP: &str = "Site Distribution";

/// Partitions records by group, sorts members by ascending id, and orders the
/// groups per the canonical priority list.
pub fn build_traversal(records: &[MetricRecord]) -> Vec<(String, Vec<MetricRecord>)> {
    let mut by_group: BTreeMap<String, Vec<MetricRecord>> = BTreeMap::new();
    for record in records {
        by_group
            .entry(record.chart_group.clone())
            .or_default()
            .push(record.clone());
    }
    for members in by_group.values_mut() {
        members.sort_by_key(|record| record.id);
    }

    let mut traversal = Vec::with_capacity(by_group.len());
    for name in GROUP_TRAVERSAL_ORDER {
        if let Some(members) = by_group.remove(name) {
            traversal.push((name.to_string(), members));
        }
    }
    // BTreeMap iteration keeps the leftover groups alphabetical.
    for (name, members) in by_group {
        traversal.push((name, members));
    }
    traversal
}

/// Resolves the cursor to a live position, re-initializing when the dataset
/// changed underneath it, and returns the record at that position.
pub fn resolve<'a>(
    cursor: &mut WorkerCursor,
    traversal: &'a [(String, Vec<MetricRecord>)],
) -> Option<&'a MetricRecord> {
    if traversal.is_empty() {
        cursor.group = None;
        cursor.index = 0;
        return None;
    }

    let position = cursor
        .group
        .as_deref()
        .and_then(|group| traversal.iter().position(|(name, _)| name == group));
    let (group_index, member_index) = match position {
        Some(group_index) if cursor.index < traversal[group_index].1.len() => {
            (group_index, cursor.index)
        }
        Some(group_index) => ((group_index + 1) % traversal.len(), 0),
        None => (0, 0),
    };

    cursor.group = Some(traversal[group_index].0.clone());
    cursor.index = member_index;
    traversal[group_index].1.get(member_index)
}

/// Index + 1 within the group, wrapping to the next group at the end; the
/// wrap from the last group back to the first bumps the loop counter.
pub fn advance(cursor: &mut WorkerCursor, traversal: &[(String, Vec<MetricRecord>)]) {
    if traversal.is_empty() {
        cursor.group = None;
        cursor.index = 0;
        return;
    }

    let Some(group_index) = cursor
        .group
        .as_deref()
        .and_then(|group| traversal.iter().position(|(name, _)| name == group))
    else {
        cursor.group = Some(traversal[0].0.clone());
        cursor.index = 0;
        return;
    };

    cursor.index += 1;
    if cursor.index >= traversal[group_index].1.len() {
        let next = group_index + 1;
        if next >= traversal.len() {
            cursor.loops += 1;
        }
        cursor.group = Some(traversal[next % traversal.len()].0.clone());
        cursor.index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ServerTarget;
    use chrono::Utc;

    fn record(id: i64, group: &str) -> MetricRecord {
        MetricRecord {
            id,
            chart_group: group.to_string(),
            variable_name: format!("{} #{}", group, id),
            data_point: format!("dp-{}", id),
            server_name: ServerTarget::P21,
            table_name: "oe_hdr".to_string(),
            production_sql_expression: "SELECT 1 AS result;".to_string(),
            value: 0.0,
            prod_value: None,
            last_updated: Utc::now(),
            value_column: "result".to_string(),
            filter_column: None,
            filter_value: None,
            calculation_type: None,
        }
    }

    #[test]
    fn traversal_respects_priority_order_and_sorts_by_id() {
        let records = vec![
            record(2, "AR Aging"),
            record(9, "Key Metrics"),
            record(1, "AR Aging"),
            record(3, "Key Metrics"),
        ];
        let traversal = build_traversal(&records);
        assert_eq!(traversal[0].0, "Key Metrics");
        assert_eq!(traversal[1].0, "AR Aging");
        assert_eq!(
            traversal[0].1.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![3, 9]
        );
        assert_eq!(
            traversal[1].1.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn unknown_groups_follow_the_priority_list_alphabetically() {
        let records = vec![
            record(1, "Zeta Custom"),
            record(2, "Alpha Custom"),
            record(3, "Web Orders"),
        ];
        let traversal = build_traversal(&records);
        let names: Vec<&str> = traversal.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["Web Orders", "Alpha Custom", "Zeta Custom"]);
    }

    #[test]
    fn advance_wraps_groups_and_counts_loops() {
        let records = vec![
            record(1, "Key Metrics"),
            record(2, "Key Metrics"),
            record(3, "AR Aging"),
        ];
        let traversal = build_traversal(&records);
        let mut cursor = WorkerCursor::default();

        let visited: Vec<i64> = (0..4)
            .map(|_| {
                let id = resolve(&mut cursor, &traversal).expect("record").id;
                advance(&mut cursor, &traversal);
                id
            })
            .collect();
        assert_eq!(visited, vec![1, 2, 3, 1]);
        assert_eq!(cursor.loops, 1);
    }

    #[test]
    fn resolve_reinitializes_when_the_group_disappeared() {
        let traversal = build_traversal(&[record(1, "Key Metrics")]);
        let mut cursor = WorkerCursor {
            group: Some("Inventory".to_string()),
            index: 4,
            loops: 2,
        };
        let found = resolve(&mut cursor, &traversal).expect("record");
        assert_eq!(found.id, 1);
        assert_eq!(cursor.group.as_deref(), Some("Key Metrics"));
        assert_eq!(cursor.index, 0);
        assert_eq!(cursor.loops, 2);
    }
}
