mod util;

use mesh_cmfe::prelude::*;
use util::*;

fn cfg() -> CmfeConfig {
    CmfeConfig::new("u", "out", "d")
}

fn output_values(tree: &MeshTree) -> Vec<Vec<f64>> {
    tree.pieces()
        .iter()
        .map(|p| p.field("out").expect("output field").data.clone())
        .collect()
}

#[test]
fn unit_hex_centroid_resolves_to_mean_of_corners() {
    let corners = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
        [0.0, 1.0, 1.0],
    ];
    let mut hex = MeshPiece::new(corners, vec![(CellType::Hexahedron, (0..8).collect())]).unwrap();
    hex.add_field("u", Field::scalar(Centering::Nodal, (0..8).map(f64::from).collect()))
        .unwrap();
    let target = MeshTree::from(probes(vec![[0.5, 0.5, 0.5], [10.0, 10.0, 10.0]], 99.0));
    let out = evaluate_position_cmfe(&target, &MeshTree::from(hex), &cfg(), &NoComm).unwrap();
    let vals = &output_values(&out)[0];
    assert!((vals[0] - 3.5).abs() < 1e-12);
    assert_eq!(vals[1], 99.0);
}

#[test]
fn interior_points_match_direct_evaluation() {
    let source = MeshTree::from_pieces(hex_slabs(4, 2));
    let pts = random_points(11, 300, 0.0, 1.0);
    let target = MeshTree::from(probes(pts.clone(), -1.0));
    let out = evaluate_position_cmfe(&target, &source, &cfg(), &NoComm).unwrap();
    for (p, v) in pts.iter().zip(&output_values(&out)[0]) {
        assert!((v - linear(*p)).abs() < 1e-10, "{p:?}: {v} vs {}", linear(*p));
    }
}

#[test]
fn exterior_points_take_the_default() {
    let source = MeshTree::from_pieces(hex_slabs(2, 1));
    let pts = random_points(5, 100, 1.5, 3.0);
    let target = MeshTree::from(probes(pts, 7.25));
    let out = evaluate_position_cmfe(&target, &source, &cfg(), &NoComm).unwrap();
    assert!(output_values(&out)[0].iter().all(|&v| v == 7.25));
}

#[test]
fn zonal_target_default_is_recentered() {
    // source only covers x in [0, 0.5]; the target block sits beside it
    let source = MeshTree::from(hex_block([0, 0, 0], [1, 2, 2], 0.5));
    let mut target = hex_block([2, 0, 0], [3, 1, 1], 1.0);
    // zonal default on a nodal request: each node averages its cells
    target
        .add_field("d", Field::scalar(Centering::Zonal, vec![5.0]))
        .unwrap();
    let out = evaluate_position_cmfe(&MeshTree::from(target), &source, &cfg(), &NoComm).unwrap();
    assert!(output_values(&out)[0].iter().all(|&v| v == 5.0));
}

#[test]
fn ghost_cells_never_answer() {
    let mut src = hex_block([0, 0, 0], [2, 1, 1], 1.0);
    src.add_field("ghost", Field::scalar(Centering::Zonal, vec![0.0, 1.0]))
        .unwrap();
    let target = MeshTree::from(probes(vec![[0.5, 0.5, 0.5], [1.5, 0.5, 0.5]], -3.0));
    let cfg = CmfeConfig {
        ghost_var: Some("ghost".into()),
        ..cfg()
    };
    let out = evaluate_position_cmfe(&target, &MeshTree::from(src), &cfg, &NoComm).unwrap();
    let vals = &output_values(&out)[0];
    assert!((vals[0] - linear([0.5, 0.5, 0.5])).abs() < 1e-12);
    assert_eq!(vals[1], -3.0);
}

#[test]
fn two_dimensional_quads() {
    let pts = vec![
        [0.0, 0.0, 0.0],
        [2.0, 0.0, 0.0],
        [2.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
    ];
    let mut quad = MeshPiece::new(pts, vec![(CellType::Quadrilateral, vec![0, 1, 2, 3])]).unwrap();
    quad.add_field("u", Field::scalar(Centering::Nodal, vec![0.0, 2.0, 3.0, 1.0]))
        .unwrap();
    let target = MeshTree::from(probes(vec![[1.0, 0.5, 0.0], [1.0, 0.5, 0.25]], 0.0));
    let out = evaluate_position_cmfe(&target, &MeshTree::from(quad), &cfg(), &NoComm).unwrap();
    let vals = &output_values(&out)[0];
    assert!((vals[0] - 1.5).abs() < 1e-12);
    // off the plane of the quad
    assert_eq!(vals[1], 0.0);
}

#[test]
fn tree_shape_and_existing_fields_survive() {
    let source = MeshTree::from_pieces(hex_slabs(2, 2));
    let target = MeshTree::Node(vec![
        MeshTree::from(probes(vec![[0.25; 3]], 0.0)),
        MeshTree::Node(vec![MeshTree::Leaf(None), MeshTree::from(probes(vec![[0.75; 3]], 0.0))]),
    ]);
    let out = evaluate_position_cmfe(&target, &source, &cfg(), &NoComm).unwrap();
    assert_eq!(out.num_pieces(), 2);
    let MeshTree::Node(children) = &out else {
        panic!("root must stay a node");
    };
    assert!(matches!(&children[1], MeshTree::Node(inner) if inner.len() == 2));
    for piece in out.pieces() {
        assert!(piece.has_field("d"));
        assert!(piece.has_field("out"));
    }
}
