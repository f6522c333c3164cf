#![cfg(feature = "mpi-support")]
// Run with: mpirun -n 4 cargo test --features mpi-support --test mpi_cmfe

use mesh_cmfe::algs::communicator::{Communicator, MpiComm};
use mesh_cmfe::algs::field_transfer::{CmfeConfig, evaluate_position_cmfe};
use mesh_cmfe::data::{Centering, Field, MeshPiece, MeshTree};
use mesh_cmfe::topology::cell_type::CellType;

fn unit_hex(x0: f64) -> MeshPiece {
    let corners = [
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [1.0, 1.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 0.0, 1.0],
        [1.0, 1.0, 1.0],
        [0.0, 1.0, 1.0],
    ];
    let pts = corners.iter().map(|c| [c[0] + x0, c[1], c[2]]).collect();
    MeshPiece::new(pts, vec![(CellType::Hexahedron, (0..8).collect())]).unwrap()
}

#[test]
fn each_rank_samples_its_neighbours_hex() {
    let comm = MpiComm::new().unwrap();
    let (rank, size) = (comm.rank(), comm.size());

    let mut source = unit_hex(rank as f64);
    source
        .add_field("u", Field::scalar(Centering::Zonal, vec![rank as f64]))
        .unwrap();

    let next = (rank + 1) % size;
    let mut target = MeshPiece::new(
        vec![[next as f64 + 0.5, 0.5, 0.5], [-5.0, 0.5, 0.5]],
        vec![(CellType::Vertex, vec![0]), (CellType::Vertex, vec![1])],
    )
    .unwrap();
    target
        .add_field("d", Field::scalar(Centering::Nodal, vec![-1.0, -1.0]))
        .unwrap();

    let cfg = CmfeConfig::new("u", "out", "d");
    let out = evaluate_position_cmfe(&MeshTree::from(target), &MeshTree::from(source), &cfg, &comm)
        .unwrap();
    let field = out.pieces()[0].field("out").cloned().unwrap();
    // the zonal source makes the output zonal: one value per vertex cell
    assert_eq!(field.data, vec![next as f64, -1.0]);
}
