//! Application: how the program under study is built and parallelized.

use super::{ComponentHooks, APPLICATION, MEASUREMENT, PROJECT, TARGET};
use crate::model::ModelDef;
use crate::schema::{Attribute, CompatRule, Expect, Schema};

fn feature(name: &'static str, description: &'static str) -> Attribute {
    Attribute::boolean(name)
        .default_value(false)
        .rebuild_required()
        .description(description)
}

/// Application schema
#[must_use]
pub fn schema() -> Schema {
    Schema::new(APPLICATION, "application")
        .attribute(Attribute::string("name").required().unique())
        .attribute(Attribute::collection("projects", PROJECT).via("applications"))
        .attribute(
            Attribute::string("linkage")
                .choices(["static", "dynamic"])
                .default_value("dynamic")
                .rebuild_required()
                .description("application linkage"),
        )
        .attribute(feature("openmp", "uses OpenMP").compat(
            true,
            CompatRule::encourage(MEASUREMENT, "openmp", ["ompt", "opari"]),
        ))
        .attribute(feature("pthreads", "uses POSIX threads"))
        .attribute(feature("tbb", "uses Thread Building Blocks"))
        .attribute(
            feature("mpi", "uses MPI")
                .compat(true, CompatRule::require(MEASUREMENT, "mpi", true))
                .compat(true, CompatRule::encourage(TARGET, "mpi_cc", Expect::Defined)),
        )
        .attribute(
            feature("cuda", "uses NVIDIA CUDA")
                .compat(true, CompatRule::require(TARGET, "cuda_toolkit", Expect::Defined)),
        )
        .attribute(feature("shmem", "uses SHMEM"))
        .attribute(feature("mpc", "uses MPC"))
        .attribute(feature("opencl", "uses OpenCL"))
        .attribute(Attribute::string("select_file").description("selective instrumentation file"))
}

pub(crate) fn definition() -> ModelDef {
    ModelDef::new(schema(), ComponentHooks::new(APPLICATION))
}
