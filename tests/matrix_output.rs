use dosedist::arena::Arena;
use dosedist::config::DistanceConfig;
use dosedist::progress::NoopProgress;
use dosedist::run;
use dosedist::types::ParallelJob;
use dosedist::write::{MatrixKind, write_ids, write_matrix};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use tempfile::tempdir;

const SAMPLE: &str = "ID_1 ID_2 missing sex phenotype\n0 0 0 D P\n\
F1 A 0 1 NA\n\
F2 B 0 2 1.5\n\
F3 C 0 1 -2\n\
F4 D 0 2 0\n";

// dosages: marker 1 = 0 1 2 1, marker 2 = 2 2 0 1
const GEN: &str = "1 rs1 100 A G 1 0 0 0 1 0 0 0 1 0 1 0\n\
1 rs2 200 C T 0 0 1 0 0 1 1 0 0 0 1 0\n";

fn parse_rows(text: &str) -> Vec<Vec<f64>> {
    text.lines()
        .map(|line| line.split('\t').map(|v| v.parse().expect("float")).collect())
        .collect()
}

#[test]
fn matrices_and_ids_round_trip_through_files() {
    let dir = tempdir().expect("temporary directory");
    let gen_path = dir.path().join("in.gen");
    let sample_path = dir.path().join("in.sample");
    fs::write(&gen_path, GEN).expect("write .gen");
    fs::write(&sample_path, SAMPLE).expect("write .sample");
    let prefix = dir.path().join("out");

    let mut arena = Arena::with_capacity(1 << 22).expect("arena");
    let mut scope = arena.scope();
    let config = DistanceConfig {
        threads: 2,
        ..Default::default()
    };
    let (samples, distances) =
        run(&mut scope, &gen_path, &sample_path, &config, &mut NoopProgress).expect("run");
    assert_eq!(samples.phenotype(0), None);
    assert_eq!(samples.phenotype(2), Some(-2.0));

    let ids = write_ids(&prefix, MatrixKind::Distance, &samples).expect("ids");
    assert_eq!(ids, dir.path().join("out.dist.id"));
    assert_eq!(
        fs::read_to_string(&ids).expect("read ids"),
        "F1\tA\nF2\tB\nF3\tC\nF4\tD\n"
    );

    let plain = write_matrix(
        &prefix,
        &distances.matrix,
        MatrixKind::Distance,
        false,
        ParallelJob::SINGLE,
    )
    .expect("write .dist");
    let rows = parse_rows(&fs::read_to_string(&plain).expect("read .dist"));
    // raw distances: (1,0)=1 (2,0)=4 (2,1)=3 (3,0)=2 (3,1)=1 (3,2)=2, scaled by 0.5 / 2
    assert_eq!(
        rows,
        vec![vec![0.25], vec![1.0, 0.75], vec![0.5, 0.25, 0.5]]
    );

    let ibs = write_matrix(
        &prefix,
        &distances.matrix,
        MatrixKind::Ibs,
        true,
        ParallelJob::SINGLE,
    )
    .expect("write .mibs.gz");
    assert_eq!(ibs, dir.path().join("out.mibs.gz"));
    let mut text = String::new();
    GzDecoder::new(File::open(&ibs).expect("open .mibs.gz"))
        .read_to_string(&mut text)
        .expect("decompress");
    let rows = parse_rows(&text);
    assert_eq!(rows[0], vec![0.75]);
    assert_eq!(rows[2], vec![0.5, 0.75, 0.5]);
}
