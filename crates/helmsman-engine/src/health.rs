//! Health waits — bounded polling between pipeline steps.
//!
//! `wait-for-instance-health` probes a healthcheck endpoint on each
//! instance of the new ASG until at least `min` answer 2xx.
//! `wait-for-elb-health` polls the selected load balancers until every
//! instance of the new ASG is `InService`. Both share the tracker's
//! retry-budget discipline and terminal callbacks.

use tracing::{debug, error, warn};

use helmsman_store::{Deployment, LogEntry, Task};

use crate::engine::PipelineEngine;
use crate::error::{EngineError, EngineResult};

const IN_SERVICE: &str = "InService";

impl PipelineEngine {
    pub(crate) fn spawn_instance_health(&self, deployment: &Deployment, task: &Task) {
        let engine = self.clone();
        let deployment = deployment.clone();
        let task = task.clone();
        tokio::spawn(async move {
            engine.instance_health_loop(deployment, task).await;
        });
    }

    pub(crate) fn spawn_elb_health(&self, deployment: &Deployment, task: &Task) {
        let engine = self.clone();
        let deployment = deployment.clone();
        let task = task.clone();
        tokio::spawn(async move {
            engine.elb_health_loop(deployment, task).await;
        });
    }

    async fn instance_health_loop(&self, deployment: Deployment, mut task: Task) {
        let min = deployment.parameters.min().unwrap_or(0) as usize;
        let Some(asg) = deployment.parameters.new_asg_name().map(str::to_string) else {
            let cause = EngineError::MissingParameter("new_asg_name");
            self.fail_task(&deployment.id, task, &cause).await;
            return;
        };

        let mut retries = self.config().task_retries;
        let mut shutdown = self.shutdown();
        let mut last_reported = None;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config().health_poll_interval) => {}
                _ = shutdown.changed() => {
                    debug!(deployment_id = %deployment.id, "instance health wait shutting down");
                    return;
                }
            }

            match self.count_healthy_instances(&deployment, &asg).await {
                Ok(healthy) => {
                    if last_reported != Some(healthy) {
                        task.log
                            .push(LogEntry::now(format!("{healthy}/{min} instances healthy")));
                        if let Err(e) = self.store().update_task(&deployment.id, &task) {
                            warn!(deployment_id = %deployment.id, error = %e, "could not persist health progress");
                        }
                        last_reported = Some(healthy);
                    }
                    if healthy >= min {
                        self.task_finished(deployment.id.clone(), task).await;
                        return;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(deployment_id = %deployment.id, error = %e, "transient failure during instance health wait");
                }
                Err(e) => {
                    error!(
                        deployment_id = %deployment.id,
                        error = %e,
                        "unrecoverable failure during instance health wait, leaving it for the restart sweep"
                    );
                    return;
                }
            }

            if retries == 0 {
                self.task_timed_out(deployment.id.clone(), task).await;
                return;
            }
            retries -= 1;
        }
    }

    /// Probe every instance of the ASG; count 2xx responders.
    async fn count_healthy_instances(
        &self,
        deployment: &Deployment,
        asg: &str,
    ) -> EngineResult<usize> {
        let details = self
            .remote()
            .group_details(&deployment.environment, &deployment.region, asg)
            .await?;
        let mut healthy = 0;
        for instance in &details.instances {
            let Some(ip) = instance.private_ip_address.as_deref() else {
                continue;
            };
            let url = format!(
                "http://{ip}:{}{}",
                self.config().instance_health_port,
                self.config().instance_health_path
            );
            match self.remote().get_text(&url).await {
                Ok((status, _)) if (200..300).contains(&status) => healthy += 1,
                Ok((status, _)) => {
                    debug!(instance_id = %instance.instance_id, status, "instance not yet healthy")
                }
                Err(e) => {
                    debug!(instance_id = %instance.instance_id, error = %e, "instance probe failed")
                }
            }
        }
        Ok(healthy)
    }

    async fn elb_health_loop(&self, deployment: Deployment, mut task: Task) {
        let Some(asg) = deployment.parameters.new_asg_name().map(str::to_string) else {
            let cause = EngineError::MissingParameter("new_asg_name");
            self.fail_task(&deployment.id, task, &cause).await;
            return;
        };
        let load_balancers = deployment.parameters.selected_load_balancers();

        let mut retries = self.config().task_retries;
        let mut shutdown = self.shutdown();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config().health_poll_interval) => {}
                _ = shutdown.changed() => {
                    debug!(deployment_id = %deployment.id, "ELB health wait shutting down");
                    return;
                }
            }

            match self.all_in_service(&deployment, &asg, &load_balancers).await {
                Ok(true) => {
                    task.log.push(LogEntry::now(format!(
                        "All instances of {asg} are {IN_SERVICE}"
                    )));
                    if let Err(e) = self.store().update_task(&deployment.id, &task) {
                        warn!(deployment_id = %deployment.id, error = %e, "could not persist ELB health progress");
                    }
                    self.task_finished(deployment.id.clone(), task).await;
                    return;
                }
                Ok(false) => {}
                Err(e) if e.is_transient() => {
                    warn!(deployment_id = %deployment.id, error = %e, "transient failure during ELB health wait");
                }
                Err(e) => {
                    error!(
                        deployment_id = %deployment.id,
                        error = %e,
                        "unrecoverable failure during ELB health wait, leaving it for the restart sweep"
                    );
                    return;
                }
            }

            if retries == 0 {
                self.task_timed_out(deployment.id.clone(), task).await;
                return;
            }
            retries -= 1;
        }
    }

    /// Every instance of the ASG must be `InService` on every selected
    /// load balancer.
    async fn all_in_service(
        &self,
        deployment: &Deployment,
        asg: &str,
        load_balancers: &[String],
    ) -> EngineResult<bool> {
        let details = self
            .remote()
            .group_details(&deployment.environment, &deployment.region, asg)
            .await?;
        if details.instances.is_empty() {
            return Ok(false);
        }

        for load_balancer in load_balancers {
            let lb = self
                .remote()
                .load_balancer(&deployment.environment, &deployment.region, load_balancer)
                .await?;
            for instance in &details.instances {
                let in_service = lb
                    .instance_states
                    .iter()
                    .any(|s| s.instance_id == instance.instance_id && s.state == IN_SERVICE);
                if !in_service {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
