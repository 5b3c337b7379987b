mod support;

use std::{future::Future, time::Duration};

use anyhow::{Context, Result, bail};
use fleetflow_core::{CreateHuntRequest, Delivery, InMemoryChannel, ProcessOutcome};
use fleetflow_model::{
    AgentRequest, AgentResponse, ClientId, ClientSelectionRule, FlowId,
    FlowRunnerArgs, FlowStatus, HuntRateLimit, HuntStatus, RequestId,
    ResponseStatus,
};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use support::{Harness, collect_reply, pong};

fn reply(request: &AgentRequest) -> Value {
    match request.payload.action.as_str() {
        "collect" => collect_reply(request),
        _ => pong(request),
    }
}

/// Stands in for the fleet: answers whatever shows up on the channel.
fn spawn_agent(channel: InMemoryChannel, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(2)) => {
                    for request in channel.take_all_requests().await {
                        let payload = reply(&request);
                        channel.push_response(AgentResponse::ok(&request, payload)).await;
                    }
                }
            }
        }
    })
}

async fn wait_until<F, Fut>(mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if check().await? {
                return Ok::<_, anyhow::Error>(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    match waited {
        Ok(outcome) => outcome,
        Err(_) => bail!("condition not reached in time"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runtime_drives_flows_and_hunts_to_completion() -> Result<()> {
    let h = Harness::new()?;
    let runtime = h.orchestrator.runtime();
    runtime.start().await?;
    let agent_shutdown = CancellationToken::new();
    let agent = spawn_agent(h.channel.clone(), agent_shutdown.clone());

    let flow_id = h
        .orchestrator
        .start_flow(
            ClientId::from_index(1).as_str(),
            "FanOut",
            json!({ "hops": 4 }),
            FlowRunnerArgs::default(),
        )
        .await?;
    let hunt_id = h
        .orchestrator
        .create_hunt(
            CreateHuntRequest::new(
                "Echo",
                ClientSelectionRule::Explicit {
                    clients: (2..=4).map(ClientId::from_index).collect(),
                },
            )
            .with_rate_limit(HuntRateLimit::concurrent(1)),
        )
        .await?;

    let flows = h.flows.clone();
    let hunts = h.hunts.clone();
    wait_until(|| {
        let flows = flows.clone();
        let hunts = hunts.clone();
        async move {
            let flow = flows.load(flow_id).await?;
            let hunt = hunts.get(hunt_id).await?;
            Ok(flow.status.is_terminal() && hunt.status == HuntStatus::Completed)
        }
    })
    .await?;

    runtime.shutdown().await?;
    assert!(!runtime.is_running());
    agent_shutdown.cancel();
    agent.await?;

    let flow = h.flows.load(flow_id).await?;
    assert_eq!(flow.status, FlowStatus::Terminated);
    let payloads: Vec<Value> = h
        .flows
        .results(flow_id, 0, None)
        .await?
        .into_iter()
        .map(|result| result.payload)
        .collect();
    assert_eq!(payloads, vec![json!("v0"), json!("v1"), json!("v2"), json!("v3")]);

    let hunt = h.hunts.get(hunt_id).await?;
    assert_eq!(hunt.counters.completed, 3);
    assert_eq!(hunt.counters.running, 0);
    Ok(())
}

#[tokio::test]
async fn pump_routes_responses_into_the_queue() -> Result<()> {
    let h = Harness::new()?;
    let flow_id = h
        .flows
        .start(ClientId::from_index(1), "Echo", Value::Null, FlowRunnerArgs::default())
        .await?;
    h.answer_all(pong).await;
    h.channel
        .push_response(AgentResponse {
            session_id: FlowId::new(),
            request_id: RequestId::FIRST,
            status: ResponseStatus::Ok,
            payload: None,
        })
        .await;

    assert_eq!(h.scheduler.pump_once().await?, 2);
    let queue = h.scheduler.queue();
    assert_eq!(queue.len().await, 1);
    assert_eq!(queue.pop().await, Some(flow_id));
    assert!(queue.is_empty().await);

    h.scheduler.enqueue(flow_id).await;
    assert!(h.settle().await? >= 1);
    assert_eq!(h.flows.load(flow_id).await?.status, FlowStatus::Terminated);
    Ok(())
}

#[tokio::test]
async fn submitted_responses_bypass_the_channel() -> Result<()> {
    let h = Harness::new()?;
    let client = ClientId::from_index(2);
    let flow_id = h
        .flows
        .start(client.clone(), "Echo", Value::Null, FlowRunnerArgs::default())
        .await?;
    let request = h
        .channel
        .take_requests(&client)
        .await
        .into_iter()
        .next()
        .context("request sent")?;

    let response = AgentResponse::ok(&request, json!({ "reply": "direct" }));
    assert_eq!(
        h.orchestrator.submit_response(response.clone()).await?,
        Delivery::Accepted
    );
    assert_eq!(h.scheduler.queue().len().await, 1);
    h.settle().await?;

    let results = h.flows.results(flow_id, 0, None).await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].payload, json!("direct"));
    assert_eq!(
        h.orchestrator.submit_response(response).await?,
        Delivery::Duplicate
    );
    Ok(())
}

#[tokio::test]
async fn busy_flow_is_requeued() -> Result<()> {
    let h = Harness::new()?;
    let client = ClientId::from_index(3);
    let flow_id = h
        .flows
        .start(client.clone(), "Echo", Value::Null, FlowRunnerArgs::default())
        .await?;
    h.answer_all(pong).await;
    h.scheduler.pump_once().await?;
    assert_eq!(h.scheduler.queue().pop().await, Some(flow_id));

    let lease = h
        .flows
        .leases()
        .try_acquire(flow_id, "elsewhere")
        .await?
        .context("lease is free")?;
    let worker = h.scheduler.worker_id(0);
    assert_eq!(
        h.scheduler.drive(flow_id, &worker).await?,
        ProcessOutcome::LeaseBusy
    );
    assert_eq!(h.scheduler.queue().len().await, 1);

    h.flows.leases().release(&lease).await?;
    h.settle().await?;
    assert_eq!(h.flows.load(flow_id).await?.status, FlowStatus::Terminated);
    Ok(())
}
