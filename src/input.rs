use std::io::BufRead;

use crate::error::FlowspecError;
use crate::hregex::HRegex;
use crate::labeling::{ComponentValue, FlowTuple, HierarchyLabeling, Ipv4Prefix};

/// Flows parsed from a flow stream, plus the longest path length seen
/// (the dimension the path labeling normalizes costs to).
#[derive(Debug)]
pub struct ParsedFlows {
    pub flows: Vec<FlowTuple>,
    pub dimension: usize,
}

/// Parses one flow per line: whitespace-separated path labels, each
/// optionally marked with a trailing `+`. With `with_ip` the first token is a
/// dotted-quad IPv4 address, parsed as a `/32` prefix. Blank lines are
/// skipped; unknown labels abort before any clustering happens.
pub fn parse_flows(
    reader: impl BufRead,
    with_ip: bool,
    hierarchy: &HierarchyLabeling,
) -> Result<ParsedFlows, FlowspecError> {
    let mut flows = Vec::new();
    let mut dimension = 0;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = line_no + 1;
        let mut tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let mut components = Vec::new();
        if with_ip {
            let ip: Ipv4Prefix = tokens.remove(0).parse()?;
            components.push(ComponentValue::Prefix(ip));
        }
        if tokens.is_empty() {
            return Err(FlowspecError::EmptyFlow { line: line_no });
        }

        let path = HRegex::parse(&tokens, hierarchy).map_err(|e| match e {
            FlowspecError::UnknownLabel { label, .. } => {
                FlowspecError::UnknownLabel { label, line: line_no }
            }
            other => other,
        })?;
        dimension = dimension.max(path.len());
        components.push(ComponentValue::Path(path));

        flows.push(FlowTuple::new(components));
    }

    Ok(ParsedFlows { flows, dimension })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn hierarchy() -> HierarchyLabeling {
        HierarchyLabeling::from_json(
            r#"{
                "s1": {"cost": 1, "parents": ["Any"]},
                "u1": {"cost": 1, "parents": ["Any"]},
                "Any": {"cost": 2, "parents": []}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_paths_and_tracks_the_dimension() {
        let h = hierarchy();
        let input = "u1 s1\n\nu1 s1+ u1\n";
        let parsed = parse_flows(Cursor::new(input), false, &h).unwrap();

        assert_eq!(parsed.flows.len(), 2);
        assert_eq!(parsed.dimension, 3);

        let expected = HRegex::parse(&["u1", "s1+", "u1"], &h).unwrap();
        assert_eq!(
            parsed.flows[1].components(),
            &[ComponentValue::Path(expected)]
        );
    }

    #[test]
    fn leading_token_is_an_address_when_requested() {
        let h = hierarchy();
        let parsed = parse_flows(Cursor::new("10.0.0.1 u1 s1\n"), true, &h).unwrap();

        assert_eq!(parsed.flows.len(), 1);
        assert_eq!(parsed.dimension, 2);
        assert_eq!(
            parsed.flows[0].components()[0],
            ComponentValue::Prefix("10.0.0.1/32".parse().unwrap())
        );
    }

    #[test]
    fn unknown_labels_carry_their_line_number() {
        let h = hierarchy();
        let err = parse_flows(Cursor::new("u1 s1\nu1 ghost\n"), false, &h).unwrap_err();
        match err {
            FlowspecError::UnknownLabel { label, line } => {
                assert_eq!(label, "ghost");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn an_address_without_a_path_is_an_empty_flow() {
        let h = hierarchy();
        assert!(matches!(
            parse_flows(Cursor::new("10.0.0.1\n"), true, &h),
            Err(FlowspecError::EmptyFlow { line: 1 })
        ));
    }
}
