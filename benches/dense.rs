#[macro_use]
extern crate criterion;

use criterion::Criterion;
use ndarray::array;

use lmm_core::dae::DaeIntegrator;
use lmm_core::driver::StepEngine;
use lmm_core::ewt::Tolerances;
use lmm_core::linear_solver::dense::DirectDense;
use lmm_core::lorenz63::Lorenz63Dae;

fn bench_lorenz_dae(c: &mut Criterion) {
    c.bench_function("lorenz63_dae_100_steps", |b| {
        b.iter(|| {
            let f = Lorenz63Dae::default();
            let ls: DirectDense<f64> = DirectDense::new(
                3,
                Box::new(|cj, y, _yp, j| {
                    let params = lmm_core::lorenz63::LorenzParams::default();
                    j.fill(0.0);
                    j[[0, 0]] = cj + params.p;
                    j[[0, 1]] = -params.p;
                    j[[1, 0]] = -(params.r - y[2]);
                    j[[1, 1]] = cj + 1.0;
                    j[[1, 2]] = y[0];
                    j[[2, 0]] = -y[1];
                    j[[2, 1]] = -y[0];
                    j[[2, 2]] = cj + params.b;
                    Ok(())
                }),
            );
            let mut ida = DaeIntegrator::new(
                f,
                ls,
                array![1.0, 1.0, 1.0],
                array![0.0, 0.0, 0.0],
                Tolerances::ScalarScalar {
                    reltol: 1e-6,
                    abstol: 1e-8,
                },
            );
            ida.set_initial_step(1e-4);
            for _ in 0..100 {
                let _ = StepEngine::take_step(&mut ida);
            }
        })
    });
}

criterion_group!(benches, bench_lorenz_dae);
criterion_main!(benches);
