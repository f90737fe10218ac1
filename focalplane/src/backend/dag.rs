//! Distributed batch backend producing an HTCondor DAGMan job graph.
//!
//! Nothing runs while jobs are submitted: every trim batch and job becomes one
//! or more graph nodes with a `.submit` description in the working directory.
//! `drain` writes `<obs>.dag` and submits the whole graph once. Trimming is
//! deferred to the graph, so each raytrace node gets a PRE script that appends
//! its chip's trimmed catalog to the node's parameter file. The last raytrace
//! node of every job gets a POST script that compresses its electron image, and
//! the last node a POST script that moves its images to the output directory.
//! In the vanilla universe trim nodes also transfer the catalog fragments and
//! raytrace nodes the observation's screens.
//!
//! ```text
//! trim_<obs>_<batch> ──► raytrace_<fid> ──► e2adc_<fid>
//! trim_<obs>_<batch> ──► raytrace_<fid>_ckpt0 ──► raytrace_<fid>_ckpt1 ──► ...
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use shared::fs_util::glob_in;
use shared::params::write_atomic;

use super::script::{compress_script, finish_script, sh_quote};
use super::{ExecutionBackend, JobEnv, ScheduleReport, TrimMode};
use crate::context::Universe;
use crate::error::{OrchestratorError, Result};
use crate::expand::TrimBatch;
use crate::job::Job;
use crate::naming::ObservationFiles;
use crate::tool::ToolRunner;

/// Program used to submit the graph when none is configured.
pub const DEFAULT_SUBMIT_PROGRAM: &str = "condor_submit_dag";

const TRIM: &str = "trim";
const RAYTRACE: &str = "raytrace";
const E2ADC: &str = "e2adc";

/// Files a node needs beside its own parameter file.
#[derive(Clone, Copy)]
enum Inputs {
    Params,
    Catalogs,
    Screens,
}

struct Node {
    name: String,
    submit_file: String,
    pre: Option<String>,
    post: Option<String>,
}

pub struct DagBackend {
    env: Arc<JobEnv>,
    universe: Universe,
    checkpoint: u32,
    submit_program: Option<String>,
    files: Option<ObservationFiles>,
    catalogs: Vec<String>,
    screens: Vec<String>,
    nodes: Vec<Node>,
    edges: Vec<(String, String)>,
    trim_nodes: HashMap<usize, String>,
    jobs: usize,
}

impl DagBackend {
    /// `submit_program` of `None` only writes the graph.
    pub fn new(
        env: Arc<JobEnv>,
        universe: Universe,
        checkpoint: u32,
        submit_program: Option<String>,
    ) -> Self {
        Self {
            env,
            universe,
            checkpoint,
            submit_program,
            files: None,
            catalogs: Vec::new(),
            screens: Vec::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
            trim_nodes: HashMap::new(),
            jobs: 0,
        }
    }

    fn observation(&mut self, observation_id: &str) -> Result<ObservationFiles> {
        if let Some(files) = &self.files {
            if files.observation_id() != observation_id {
                return Err(OrchestratorError::Configuration(format!(
                    "job graph for observation {} cannot take observation {observation_id}",
                    files.observation_id()
                )));
            }
            return Ok(files.clone());
        }

        let files = ObservationFiles::new(observation_id);
        self.write_work_file(
            &append_script_name(&files),
            "#!/bin/sh\nset -e\ncat \"$1\" >> \"$2\"\n",
            true,
        )?;
        self.catalogs = self.catalog_fragments(&files)?;
        self.screens = self.screen_files(&files)?;
        self.files = Some(files.clone());
        Ok(files)
    }

    /// Paths listed in `catlist_<obs>.pars`.
    fn catalog_fragments(&self, files: &ObservationFiles) -> Result<Vec<String>> {
        let path = self.env.work_dir.join(files.catalog_list());
        let text = std::fs::read_to_string(&path).map_err(OrchestratorError::file(&path))?;
        let mut fragments = Vec::new();
        for line in text.lines() {
            let words: Vec<&str> = line.split_whitespace().collect();
            if let ["catalog", _, fragment, ..] = words.as_slice() {
                fragments.push(fragment.to_string());
            }
        }
        Ok(fragments)
    }

    fn screen_files(&self, files: &ObservationFiles) -> Result<Vec<String>> {
        let mut screens = Vec::new();
        for pattern in files.screen_patterns() {
            for path in glob_in(&self.env.work_dir, &pattern)? {
                if let Some(name) = path.file_name() {
                    screens.push(name.to_string_lossy().into_owned());
                }
            }
        }
        if self.env.work_dir.join(files.airglow_screen()).is_file() {
            screens.push(files.airglow_screen());
        }
        Ok(screens)
    }

    fn write_work_file(&self, name: &str, contents: &str, executable: bool) -> Result<()> {
        let path = self.env.work_dir.join(name);
        write_atomic(&path, contents.as_bytes())?;
        if executable {
            make_executable(&path)?;
        }
        Ok(())
    }

    /// HTCondor submit description running `program < input`.
    fn submit_description(&self, node: &str, program: &str, input: &str, inputs: Inputs) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "universe = {}", self.universe);
        let _ = writeln!(out, "executable = {}", self.env.bin_dir.join(program).display());
        let _ = writeln!(out, "input = {input}");
        let _ = writeln!(out, "initialdir = {}", self.env.work_dir.display());
        let _ = writeln!(out, "output = {node}.out");
        let _ = writeln!(out, "error = {node}.err");
        let _ = writeln!(out, "log = {node}.log");
        if self.universe == Universe::Vanilla {
            out.push_str("should_transfer_files = YES\n");
            out.push_str("when_to_transfer_output = ON_EXIT\n");
            let extra: &[String] = match inputs {
                Inputs::Params => &[],
                Inputs::Catalogs => &self.catalogs[..],
                Inputs::Screens => &self.screens[..],
            };
            let mut transfer = vec![input];
            transfer.extend(extra.iter().map(String::as_str));
            let _ = writeln!(out, "transfer_input_files = {}", transfer.join(", "));
        }
        out.push_str("queue\n");
        out
    }

    fn add_node(
        &mut self,
        name: String,
        program: &str,
        input: &str,
        inputs: Inputs,
        pre: Option<String>,
    ) -> Result<()> {
        let submit_file = format!("{name}.submit");
        let description = self.submit_description(&name, program, input, inputs);
        self.write_work_file(&submit_file, &description, false)?;
        self.nodes.push(Node {
            name,
            submit_file,
            pre,
            post: None,
        });
        Ok(())
    }

    /// Raytrace nodes of a job in execution order.
    fn add_raytrace_nodes(&mut self, files: &ObservationFiles, job: &Job) -> Result<Vec<String>> {
        let fid = job.file_id();
        let raytrace_params = job.raytrace_params();
        let append = |pars: &str| {
            format!(
                "{} {} {}",
                append_script_name(files),
                sh_quote(&files.trimmed_catalog(&job.chip_id)),
                sh_quote(pars)
            )
        };

        if self.checkpoint == 0 {
            let name = format!("{RAYTRACE}_{fid}");
            let pre = append(&raytrace_params);
            self.add_node(
                name.clone(),
                RAYTRACE,
                &raytrace_params,
                Inputs::Screens,
                Some(pre),
            )?;
            return Ok(vec![name]);
        }

        let path = self.env.work_dir.join(&raytrace_params);
        let base = std::fs::read_to_string(&path).map_err(OrchestratorError::file(&path))?;
        let mut names = Vec::new();
        for step in 0..=self.checkpoint {
            let name = format!("{RAYTRACE}_{fid}_ckpt{step}");
            let pars = format!("{name}.pars");
            let contents = format!(
                "{base}checkpointtotal {}\ncheckpointcount {step}\n",
                self.checkpoint
            );
            self.write_work_file(&pars, &contents, false)?;
            let pre = append(&pars);
            self.add_node(name.clone(), RAYTRACE, &pars, Inputs::Screens, Some(pre))?;
            names.push(name);
        }
        Ok(names)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let _ = writeln!(out, "JOB {} {}", node.name, node.submit_file);
        }
        for node in &self.nodes {
            if let Some(pre) = &node.pre {
                let _ = writeln!(out, "SCRIPT PRE {} {pre}", node.name);
            }
            if let Some(post) = &node.post {
                let _ = writeln!(out, "SCRIPT POST {} {post}", node.name);
            }
        }
        for (parent, child) in &self.edges {
            let _ = writeln!(out, "PARENT {parent} CHILD {child}");
        }
        out
    }
}

fn append_script_name(files: &ObservationFiles) -> String {
    format!("append_trimcatalog_{}.sh", files.observation_id())
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(OrchestratorError::file(path))
}

#[cfg(not(unix))]
fn make_executable(_path: &std::path::Path) -> Result<()> {
    Ok(())
}

impl ExecutionBackend for DagBackend {
    fn name(&self) -> &'static str {
        "distributed batch"
    }

    fn trim_mode(&self) -> TrimMode {
        TrimMode::Deferred
    }

    fn submit_trim(&mut self, batch: &TrimBatch) -> Result<()> {
        let files = self.observation(&batch.observation_id)?;
        let name = format!("{TRIM}_{}_{}", files.observation_id(), batch.index);
        self.add_node(name.clone(), TRIM, &batch.param_file, Inputs::Catalogs, None)?;
        self.trim_nodes.insert(batch.index, name);
        Ok(())
    }

    fn submit(&mut self, job: Job) -> Result<()> {
        let files = self.observation(&job.observation_id)?;
        let trim = self.trim_nodes.get(&job.trim_batch).cloned().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "job {} submitted before trim batch {}",
                job.file_id(),
                job.trim_batch
            ))
        })?;

        let fid = job.file_id();
        let mut chain = self.add_raytrace_nodes(&files, &job)?;
        if self.env.run_e2adc {
            let compress = format!("compress_{fid}.sh");
            self.write_work_file(&compress, &compress_script(&self.env, &job), true)?;
            if let Some(last) = self.nodes.last_mut() {
                last.post = Some(compress);
            }

            let name = format!("{E2ADC}_{fid}");
            self.add_node(name.clone(), E2ADC, &job.e2adc_params(), Inputs::Params, None)?;
            chain.push(name);
        }

        self.edges.push((trim, chain[0].clone()));
        for pair in chain.windows(2) {
            self.edges.push((pair[0].clone(), pair[1].clone()));
        }

        let finish = format!("finish_{fid}.sh");
        let script = finish_script(&self.env, &job, !self.env.run_e2adc);
        self.write_work_file(&finish, &script, true)?;
        if let Some(last) = self.nodes.last_mut() {
            last.post = Some(finish);
        }

        self.jobs += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<ScheduleReport> {
        let report = ScheduleReport {
            submitted: self.jobs,
            handed_off: self.jobs,
            ..ScheduleReport::default()
        };
        let Some(files) = self.files.clone() else {
            log::warn!("No jobs were submitted; no job graph written");
            return Ok(ScheduleReport::default());
        };

        let dag_file = files.dag_file();
        self.write_work_file(&dag_file, &self.render(), false)?;
        log::info!(
            "Wrote job graph {} with {} nodes",
            self.env.work_dir.join(&dag_file).display(),
            self.nodes.len()
        );

        match &self.submit_program {
            Some(program) => {
                ToolRunner::new(PathBuf::new(), &self.env.work_dir)
                    .run_external(program, &[dag_file.as_str()])?;
            }
            None => log::info!("Job graph not submitted; submit {dag_file} manually"),
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::script::tests::{env, job};
    use tempfile::TempDir;

    fn backend(dir: &TempDir, universe: Universe, checkpoint: u32) -> DagBackend {
        let mut env = env();
        env.work_dir = dir.path().to_path_buf();
        std::fs::write(
            dir.path().join("catlist_42.pars"),
            "catalog 0 objectcatalog_42.pars\ncatalog 1 /cats/stars.txt\n",
        )
        .unwrap();
        DagBackend::new(Arc::new(env), universe, checkpoint, None)
    }

    fn batch() -> TrimBatch {
        TrimBatch {
            observation_id: "42".to_string(),
            index: 0,
            chips: vec!["R22_S11".to_string()],
            enabled: 1,
            param_file: "trim_42_0.pars".to_string(),
        }
    }

    fn read(dir: &TempDir, name: &str) -> String {
        std::fs::read_to_string(dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_graph_links_trim_raytrace_and_readout() {
        let dir = TempDir::new().unwrap();
        let mut dag = backend(&dir, Universe::Standard, 0);

        dag.submit_trim(&batch()).unwrap();
        dag.submit(job()).unwrap();
        let report = dag.drain().unwrap();

        assert_eq!(report.submitted, 1);
        assert_eq!(report.handed_off, 1);
        assert_eq!(report.completed, 0);

        let graph = read(&dir, "42.dag");
        assert!(graph.contains("JOB trim_42_0 trim_42_0.submit"));
        assert!(graph.contains("JOB raytrace_42_R22_S11_E000 raytrace_42_R22_S11_E000.submit"));
        assert!(graph.contains("PARENT trim_42_0 CHILD raytrace_42_R22_S11_E000"));
        assert!(graph.contains("PARENT raytrace_42_R22_S11_E000 CHILD e2adc_42_R22_S11_E000"));
        assert!(graph.contains(
            "SCRIPT PRE raytrace_42_R22_S11_E000 append_trimcatalog_42.sh 'trimcatalog_42_R22_S11.pars' 'raytrace_42_R22_S11_E000.pars'"
        ));
        assert!(graph.contains("SCRIPT POST raytrace_42_R22_S11_E000 compress_42_R22_S11_E000.sh"));
        assert!(graph.contains("SCRIPT POST e2adc_42_R22_S11_E000 finish_42_R22_S11_E000.sh"));

        let submit = read(&dir, "raytrace_42_R22_S11_E000.submit");
        assert!(submit.contains("universe = standard"));
        assert!(submit.contains("executable = /opt/phosim/bin/raytrace"));
        assert!(submit.contains("input = raytrace_42_R22_S11_E000.pars"));
        assert!(!submit.contains("transfer_input_files"));
        assert!(dir.path().join("finish_42_R22_S11_E000.sh").is_file());
    }

    #[test]
    fn test_checkpoints_chain_raytrace_nodes() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("raytrace_42_R22_S11_E000.pars"), "obshistid 42\n").unwrap();
        let mut dag = backend(&dir, Universe::Vanilla, 2);

        dag.submit_trim(&batch()).unwrap();
        dag.submit(job()).unwrap();
        dag.drain().unwrap();

        let graph = read(&dir, "42.dag");
        assert!(graph.contains("PARENT trim_42_0 CHILD raytrace_42_R22_S11_E000_ckpt0"));
        assert!(graph.contains(
            "PARENT raytrace_42_R22_S11_E000_ckpt0 CHILD raytrace_42_R22_S11_E000_ckpt1"
        ));
        assert!(graph.contains(
            "PARENT raytrace_42_R22_S11_E000_ckpt2 CHILD e2adc_42_R22_S11_E000"
        ));

        let last = read(&dir, "raytrace_42_R22_S11_E000_ckpt2.pars");
        assert_eq!(last, "obshistid 42\ncheckpointtotal 2\ncheckpointcount 2\n");
        let submit = read(&dir, "raytrace_42_R22_S11_E000_ckpt1.submit");
        assert!(submit.contains("universe = vanilla"));
        assert!(submit.contains("transfer_input_files = raytrace_42_R22_S11_E000_ckpt1.pars\n"));
        assert!(graph.contains(
            "SCRIPT POST raytrace_42_R22_S11_E000_ckpt2 compress_42_R22_S11_E000.sh"
        ));
        assert!(!graph.contains("SCRIPT POST raytrace_42_R22_S11_E000_ckpt1 "));
    }

    #[test]
    fn test_vanilla_nodes_transfer_catalogs_and_screens() {
        let dir = TempDir::new().unwrap();
        for screen in [
            "atmospherescreen_42_0_coarsex.fits",
            "cloudscreen_42_1.fits",
            "airglowscreen_42.fits",
            "cloudscreen_7_0.fits",
        ] {
            std::fs::write(dir.path().join(screen), "").unwrap();
        }
        let mut dag = backend(&dir, Universe::Vanilla, 0);

        dag.submit_trim(&batch()).unwrap();
        dag.submit(job()).unwrap();
        dag.drain().unwrap();

        let trim = read(&dir, "trim_42_0.submit");
        assert!(trim.contains(
            "transfer_input_files = trim_42_0.pars, objectcatalog_42.pars, /cats/stars.txt\n"
        ));
        let raytrace = read(&dir, "raytrace_42_R22_S11_E000.submit");
        assert!(raytrace.contains(
            "transfer_input_files = raytrace_42_R22_S11_E000.pars, \
             atmospherescreen_42_0_coarsex.fits, cloudscreen_42_1.fits, airglowscreen_42.fits\n"
        ));
        let e2adc = read(&dir, "e2adc_42_R22_S11_E000.submit");
        assert!(e2adc.contains("transfer_input_files = e2adc_42_R22_S11_E000.pars\n"));
    }

    #[test]
    fn test_without_readout_raytrace_node_finishes_the_job() {
        let dir = TempDir::new().unwrap();
        let mut env = env();
        env.work_dir = dir.path().to_path_buf();
        env.run_e2adc = false;
        std::fs::write(dir.path().join("catlist_42.pars"), "").unwrap();
        let mut dag = DagBackend::new(Arc::new(env), Universe::Standard, 0, None);

        dag.submit_trim(&batch()).unwrap();
        dag.submit(job()).unwrap();
        dag.drain().unwrap();

        let graph = read(&dir, "42.dag");
        assert!(graph.contains("SCRIPT POST raytrace_42_R22_S11_E000 finish_42_R22_S11_E000.sh"));
        assert!(!graph.contains("e2adc_42"));
        assert!(!dir.path().join("compress_42_R22_S11_E000.sh").exists());
        let finish = read(&dir, "finish_42_R22_S11_E000.sh");
        let compress = finish.find("gzip -f 'lsst_e_42_R22_S11_E000.fits'").unwrap();
        let moved = finish.find("mv 'lsst_e_42_R22_S11_E000.fits.gz'").unwrap();
        assert!(compress < moved);
    }

    #[test]
    fn test_job_without_trim_batch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut dag = backend(&dir, Universe::Standard, 0);
        assert!(matches!(
            dag.submit(job()),
            Err(OrchestratorError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_graph_is_not_written() {
        let dir = TempDir::new().unwrap();
        let mut dag = backend(&dir, Universe::Standard, 0);
        let report = dag.drain().unwrap();
        assert_eq!(report, ScheduleReport::default());
        assert!(!dir.path().join("42.dag").exists());
    }
}
