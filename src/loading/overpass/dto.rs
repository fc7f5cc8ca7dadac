//! Strict schema validation for Overpass network payloads.
//!
//! Elements are validated one by one; anything that is not a well-formed
//! node or way is dropped instead of failing the whole response. A payload
//! without an `elements` array is a parse failure for the endpoint that
//! produced it.

use serde::Deserialize;

use crate::Error;

/// Validated street-network payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawNetworkResponse {
    pub nodes: Vec<RawNode>,
    pub ways: Vec<RawWay>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawNode {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawWay {
    pub id: i64,
    pub nodes: Vec<i64>,
}

#[derive(Deserialize)]
struct ResponseDto {
    elements: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ElementDto {
    Node(RawNode),
    Way(RawWay),
}

pub fn parse_network_response(body: &[u8]) -> Result<RawNetworkResponse, Error> {
    let decoded: ResponseDto = serde_json::from_slice(body)
        .map_err(|error| Error::InvalidData(format!("invalid Overpass payload: {error}")))?;

    let mut response = RawNetworkResponse::default();
    for element in decoded.elements {
        match serde_json::from_value::<ElementDto>(element) {
            Ok(ElementDto::Node(node)) if node.lat.is_finite() && node.lon.is_finite() => {
                response.nodes.push(node);
            }
            Ok(ElementDto::Way(way)) => response.ways.push(way),
            // Malformed elements and foreign element kinds are dropped.
            _ => {}
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nodes_and_ways() {
        let body = br#"{
            "elements": [
                {"type": "node", "id": 1, "lat": 49.0069, "lon": 8.4037},
                {"type": "way", "id": 7, "nodes": [1, 2, 3], "tags": {"highway": "footway"}}
            ]
        }"#;

        let response = parse_network_response(body).expect("payload should parse");
        assert_eq!(response.nodes.len(), 1);
        assert_eq!(response.ways.len(), 1);
        assert_eq!(response.ways[0].nodes, vec![1, 2, 3]);
    }

    #[test]
    fn drops_malformed_elements_silently() {
        let body = br#"{
            "elements": [
                {"type": "node", "id": 1, "lat": 49.0, "lon": 8.4},
                {"type": "node", "id": "oops", "lat": 49.0, "lon": 8.4},
                {"type": "node", "id": 2, "lon": 8.4},
                {"type": "way", "id": 7, "nodes": [1, "x"]},
                {"type": "relation", "id": 9, "members": []},
                42
            ]
        }"#;

        let response = parse_network_response(body).expect("payload should parse");
        assert_eq!(response.nodes.len(), 1);
        assert!(response.ways.is_empty());
    }

    #[test]
    fn rejects_payload_without_elements_array() {
        assert!(parse_network_response(br#"{"remark": "runtime error"}"#).is_err());
        assert!(parse_network_response(b"<html>rate limited</html>").is_err());
    }
}
