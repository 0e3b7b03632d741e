//! Measurement: what the runtime records and how code is instrumented.

use super::{ComponentHooks, APPLICATION, MEASUREMENT, PROJECT, TARGET};
use crate::model::ModelDef;
use crate::schema::{Attribute, CompatRule, Expect, Schema};

/// Measurement schema
#[must_use]
pub fn schema() -> Schema {
    Schema::new(MEASUREMENT, "measurement")
        .attribute(Attribute::string("name").required().unique())
        .attribute(Attribute::collection("projects", PROJECT).via("measurements"))
        .attribute(Attribute::boolean("baseline").default_value(false))
        .attribute(
            Attribute::string("profile")
                .choices(["tau", "merged", "cubex", "sqlite", "none"])
                .default_value("tau"),
        )
        .attribute(
            Attribute::string("trace")
                .choices(["none", "slog2", "otf2"])
                .default_value("none"),
        )
        .attribute(
            Attribute::boolean("sample")
                .default_value(false)
                .compat(true, CompatRule::exclude(APPLICATION, "linkage", "static")),
        )
        .attribute(
            Attribute::string("source_inst")
                .choices(["automatic", "manual", "never"])
                .default_value("automatic")
                .rebuild_required()
                .compat(
                    "automatic",
                    CompatRule::require(TARGET, "pdt_source", Expect::Defined),
                ),
        )
        .attribute(
            Attribute::string("compiler_inst")
                .choices(["always", "fallback", "never"])
                .default_value("never")
                .rebuild_required(),
        )
        .attribute(
            Attribute::boolean("mpi")
                .default_value(false)
                .rebuild_required()
                .compat(true, CompatRule::encourage(APPLICATION, "mpi", true)),
        )
        .attribute(
            Attribute::string("openmp")
                .choices(["ignore", "ompt", "opari"])
                .default_value("ignore")
                .rebuild_required()
                .compat("ompt", CompatRule::require(APPLICATION, "openmp", true))
                .compat("opari", CompatRule::require(APPLICATION, "openmp", true)),
        )
        .attribute(
            Attribute::boolean("cuda")
                .default_value(false)
                .compat(true, CompatRule::require(APPLICATION, "cuda", true)),
        )
        .attribute(Attribute::boolean("io").default_value(false))
        .attribute(Attribute::integer("callpath").default_value(100))
        .attribute(Attribute::boolean("throttle").default_value(true))
        .attribute(Attribute::boolean("keep_inst_files").default_value(false))
        .attribute(Attribute::string("metrics").default_value("TIME"))
}

pub(crate) fn definition() -> ModelDef {
    ModelDef::new(schema(), ComponentHooks::new(MEASUREMENT))
}
