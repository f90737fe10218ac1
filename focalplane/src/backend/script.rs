//! POSIX shell renditions of a job, for schedulers that run scripts.

use std::fmt::Write as _;
use std::path::Path;

use super::JobEnv;
use crate::job::Job;

/// Single-quote a string for `/bin/sh`.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn quote_path(path: &Path) -> String {
    sh_quote(&path.to_string_lossy())
}

fn header(out: &mut String, env: &JobEnv) {
    out.push_str("#!/bin/sh\nset -e\n");
    let _ = writeln!(out, "cd {}", quote_path(&env.work_dir));
}

/// Compress the electron image right after raytrace, before readout runs.
fn compress_electron(out: &mut String, env: &JobEnv, job: &Job) {
    let _ = writeln!(out, "gzip -f {}", sh_quote(&job.electron_image(&env.instrument)));
}

/// Compress the amplifier images and move every image of the job to the output directory.
fn finish_commands(out: &mut String, env: &JobEnv, job: &Job) {
    let instrument = &env.instrument;
    if env.run_e2adc {
        for amplifier in env.segmentation.amplifiers_of(&job.chip_id) {
            let raw = job.amplifier_image(instrument, amplifier);
            let _ = writeln!(out, "gzip -f {}", sh_quote(&raw));
            let _ = writeln!(
                out,
                "mv {} {}",
                sh_quote(&format!("{raw}.gz")),
                quote_path(
                    &env.output_dir
                        .join(job.output_amplifier_image(instrument, amplifier))
                )
            );
        }
    }
    let _ = writeln!(
        out,
        "mv {} {}",
        sh_quote(&format!("{}.gz", job.electron_image(instrument))),
        quote_path(&env.output_dir.join(job.output_electron_image(instrument)))
    );
}

/// A self-contained script running the whole job.
pub fn job_script(env: &JobEnv, job: &Job) -> String {
    let mut out = String::new();
    header(&mut out, env);

    let raytrace = job.raytrace_params();
    let _ = writeln!(
        out,
        "{} < {}",
        quote_path(&env.bin_dir.join("raytrace")),
        sh_quote(&raytrace)
    );
    compress_electron(&mut out, env, job);
    if env.clean_job_files {
        let _ = writeln!(out, "rm -f {}", sh_quote(&raytrace));
    }
    if env.run_e2adc {
        let e2adc = job.e2adc_params();
        let _ = writeln!(
            out,
            "{} < {}",
            quote_path(&env.bin_dir.join("e2adc")),
            sh_quote(&e2adc)
        );
        if env.clean_job_files {
            let _ = writeln!(out, "rm -f {}", sh_quote(&e2adc));
        }
    }
    finish_commands(&mut out, env, job);
    out
}

/// A script compressing the electron image of a job whose raytrace ran elsewhere.
pub fn compress_script(env: &JobEnv, job: &Job) -> String {
    let mut out = String::new();
    header(&mut out, env);
    compress_electron(&mut out, env, job);
    out
}

/// A script that only relocates the images of a job run elsewhere.
///
/// Without `compress` the electron image must already be compressed, see
/// [`compress_script`].
pub fn finish_script(env: &JobEnv, job: &Job, compress: bool) -> String {
    let mut out = String::new();
    header(&mut out, env);
    if compress {
        compress_electron(&mut out, env, job);
    }
    finish_commands(&mut out, env, job);
    out
}
