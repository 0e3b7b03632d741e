//! Target: the host platform and toolchain an experiment builds with.

use super::{ComponentHooks, APPLICATION, PROJECT, TARGET};
use crate::model::ModelDef;
use crate::schema::{Attribute, CompatRule, Schema};

fn toolchain(name: &'static str, description: &'static str) -> Attribute {
    Attribute::string(name)
        .rebuild_required()
        .description(description)
}

/// Target schema
#[must_use]
pub fn schema() -> Schema {
    Schema::new(TARGET, "target")
        .attribute(Attribute::string("name").required().unique())
        .attribute(Attribute::collection("projects", PROJECT).via("targets"))
        .attribute(
            Attribute::string("host_os")
                .choices(["Linux", "Darwin", "CNL"])
                .default_value("Linux")
                .rebuild_required()
                .compat("Darwin", CompatRule::exclude(APPLICATION, "linkage", "static"))
                .description("host operating system"),
        )
        .attribute(
            Attribute::string("host_arch")
                .default_value("x86_64")
                .rebuild_required()
                .description("host CPU architecture"),
        )
        .attribute(toolchain("cc", "C compiler").default_value("gcc"))
        .attribute(toolchain("cxx", "C++ compiler").default_value("g++"))
        .attribute(toolchain("fc", "Fortran compiler").default_value("gfortran"))
        .attribute(toolchain("mpi_cc", "MPI C compiler"))
        .attribute(toolchain("mpi_cxx", "MPI C++ compiler"))
        .attribute(toolchain("mpi_fc", "MPI Fortran compiler"))
        .attribute(toolchain("cuda_toolkit", "CUDA toolkit installation prefix"))
        .attribute(toolchain("pdt_source", "source instrumentor package").default_value("download"))
        .attribute(toolchain("binutils_source", "binutils package").default_value("download"))
        .attribute(toolchain("papi_source", "hardware counter package"))
        .attribute(toolchain("libunwind_source", "libunwind package").default_value("download"))
        .attribute(toolchain("tau_source", "measurement runtime package").default_value("download"))
}

pub(crate) fn definition() -> ModelDef {
    ModelDef::new(schema(), ComponentHooks::new(TARGET))
}
