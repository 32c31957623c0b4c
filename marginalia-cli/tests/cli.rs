use assert_cmd::Command;
use serde_json::{json, Value};
use tempfile::tempdir;

fn char_rects(left: f64, bottom: f64) -> Vec<Value> {
    (0..5)
        .map(|c| {
            json!({
                "left": left + 2.0 * c as f64,
                "bottom": bottom,
                "right": left + 2.0 * (c + 1) as f64,
                "top": bottom + 12.0,
            })
        })
        .collect()
}

#[test]
fn dumps_overlay_elements_for_fixture() {
    let dir = tempdir().unwrap();
    let document = dir.path().join("doc.json");
    let references = dir.path().join("refs.json");

    let fixture = json!({
        "path": "paper.pdf",
        "pages": [
            {
                "size": { "width": 612.0, "height": 792.0 },
                "text_layer": {
                    "items": [
                        {
                            "text": "hello",
                            "rect": { "left": 0.0, "bottom": 700.0, "right": 10.0, "top": 712.0 },
                            "line": 0,
                            "font_size": 12.0,
                            "char_rects": char_rects(0.0, 700.0),
                        }
                    ]
                },
                "annotations": [
                    {
                        "id": "207R",
                        "rect": { "left": 100.0, "bottom": 500.0, "right": 200.0, "top": 540.0 },
                        "color": [255, 0, 0],
                    }
                ]
            }
        ]
    });
    std::fs::write(&document, serde_json::to_vec_pretty(&fixture).unwrap()).unwrap();

    let records = json!([
        {
            "source_path": "note.md",
            "target": "paper.pdf",
            "subpath": "#page=1&selection=0,0,0,5",
            "line": 3
        },
        {
            "source_path": "other.md",
            "target": "paper.pdf",
            "subpath": "#page=1&annotation=207R"
        },
        {
            "source_path": "foreign.md",
            "target": "elsewhere.pdf",
            "subpath": "#page=1&annotation=207R"
        }
    ]);
    std::fs::write(&references, serde_json::to_vec_pretty(&records).unwrap()).unwrap();

    let output = Command::cargo_bin("marginalia")
        .unwrap()
        .arg("--document")
        .arg(&document)
        .arg("--references")
        .arg(&references)
        .output()
        .unwrap();
    assert!(output.status.success());

    let elements: Value = serde_json::from_slice(&output.stdout).unwrap();
    let elements = elements.as_array().unwrap();

    let has_class = |element: &Value, class: &str| {
        element["classes"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == class)
    };

    assert!(elements
        .iter()
        .any(|el| has_class(el, "marginalia-backlink-selection")));
    let annotated = elements
        .iter()
        .find(|el| el["annotation_id"] == "207R")
        .unwrap();
    assert!(has_class(annotated, "marginalia-backlink-annotation"));
    assert_eq!(annotated["css"]["--marginalia-color"], "rgb(255, 0, 0)");
}
