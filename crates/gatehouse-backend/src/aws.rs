//! AWS backend: S3 for files, IAM for groups and keys, EC2 for topology,
//! Route 53 for the public record, IMDS for instance identity.
//!
//! The HEAD of the primary config object at construction captures the
//! server-side-encryption envelope, which every later PUT replays.

use std::net::IpAddr;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::types::Filter;
use aws_sdk_iam::types::{EncodingType, StatusType};
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType,
};
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use ipnet::IpNet;
use tokio::sync::Mutex;

use crate::{Backend, BackendError, Fetched, NetworkInfo, Result};

/// A record this process registered, remembered for the DELETE at shutdown.
struct DnsRecord {
    zone: String,
    name: String,
    ip: IpAddr,
    set_identifier: Option<String>,
}

pub struct AwsBackend {
    bucket: String,
    prefix: String,
    imds: aws_config::imds::Client,
    s3: aws_sdk_s3::Client,
    iam: aws_sdk_iam::Client,
    ec2: aws_sdk_ec2::Client,
    route53: aws_sdk_route53::Client,
    vpc_id: String,
    subnet_id: String,
    kms_key_id: Option<String>,
    encryption: Option<ServerSideEncryption>,
    registered: Mutex<Option<DnsRecord>>,
}

impl AwsBackend {
    pub async fn new(bucket: String, prefix: String) -> Result<Self> {
        let started = std::time::Instant::now();

        let imds = aws_config::imds::Client::builder().build();

        let mac = imds_get(&imds, "/latest/meta-data/mac").await?;
        let vpc_id = imds_get(
            &imds,
            &format!("/latest/meta-data/network/interfaces/macs/{mac}/vpc-id"),
        )
        .await?;
        let subnet_id = imds_get(
            &imds,
            &format!("/latest/meta-data/network/interfaces/macs/{mac}/subnet-id"),
        )
        .await?;

        // The default chain resolves the region from IMDS on EC2.
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;

        let backend = AwsBackend {
            s3: aws_sdk_s3::Client::new(&config),
            iam: aws_sdk_iam::Client::new(&config),
            ec2: aws_sdk_ec2::Client::new(&config),
            route53: aws_sdk_route53::Client::new(&config),
            imds,
            vpc_id,
            subnet_id,
            kms_key_id: None,
            encryption: None,
            registered: Mutex::new(None),
            bucket,
            prefix,
        };

        let key = backend.key("vpn.conf");
        let head = backend
            .s3
            .head_object()
            .bucket(&backend.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                BackendError::cloud(
                    format!("HEAD {}/{}", backend.bucket, key),
                    aws_sdk_s3::error::DisplayErrorContext(&e),
                )
            })?;

        let backend = AwsBackend {
            kms_key_id: head.ssekms_key_id().map(str::to_string),
            encryption: head.server_side_encryption().cloned(),
            ..backend
        };

        tracing::info!(
            bucket = %backend.bucket,
            prefix = %backend.prefix,
            elapsed = ?started.elapsed(),
            "initialized AWS backend"
        );

        Ok(backend)
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.prefix.trim_end_matches('/'))
        }
    }

    async fn change_record(&self, action: ChangeAction, record: &DnsRecord) -> Result<()> {
        let rr_type = match record.ip {
            IpAddr::V4(_) => RrType::A,
            IpAddr::V6(_) => RrType::Aaaa,
        };

        let mut record_set = ResourceRecordSet::builder()
            .name(&record.name)
            .r#type(rr_type)
            .ttl(60)
            .resource_records(
                ResourceRecord::builder()
                    .value(record.ip.to_string())
                    .build()
                    .map_err(|e| BackendError::cloud("building DNS record", e))?,
            );

        if let Some(id) = &record.set_identifier {
            record_set = record_set.set_identifier(id).multi_value_answer(true);
        }

        let change = Change::builder()
            .action(action)
            .resource_record_set(
                record_set
                    .build()
                    .map_err(|e| BackendError::cloud("building DNS record set", e))?,
            )
            .build()
            .map_err(|e| BackendError::cloud("building DNS change", e))?;

        self.route53
            .change_resource_record_sets()
            .hosted_zone_id(&record.zone)
            .change_batch(
                ChangeBatch::builder()
                    .changes(change)
                    .build()
                    .map_err(|e| BackendError::cloud("building DNS change batch", e))?,
            )
            .send()
            .await
            .map_err(|e| {
                BackendError::cloud(
                    format!("updating record {} in zone {}", record.name, record.zone),
                    aws_sdk_route53::error::DisplayErrorContext(&e),
                )
            })?;

        Ok(())
    }
}

#[async_trait]
impl Backend for AwsBackend {
    async fn fetch_file(&self, path: &str, if_not_tag: Option<&str>) -> Result<Fetched> {
        let key = self.key(path);

        let mut request = self.s3.get_object().bucket(&self.bucket).key(&key);
        if let Some(tag) = if_not_tag {
            request = request.if_none_match(tag);
        }

        let output = match request.send().await {
            Ok(output) => output,
            Err(e) => {
                let service = e.as_service_error();
                if service.is_some_and(|se| se.is_no_such_key())
                    || e.code() == Some("AccessDenied")
                {
                    return Ok(Fetched::Missing);
                }
                if http_status(&e) == Some(304) || e.code() == Some("NotModified") {
                    return Ok(Fetched::NotModified);
                }
                return Err(BackendError::cloud(
                    format!("retrieving {}/{}", self.bucket, key),
                    aws_sdk_s3::error::DisplayErrorContext(&e),
                ));
            }
        };

        let tag = output.e_tag().unwrap_or_default().to_string();
        let body = output.body.collect().await.map_err(|e| {
            BackendError::cloud(format!("reading {}/{}", self.bucket, key), e)
        })?;

        Ok(Fetched::Modified {
            body: body.into_bytes().to_vec(),
            tag,
        })
    }

    async fn put_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let key = self.key(path);

        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .set_ssekms_key_id(self.kms_key_id.clone())
            .set_server_side_encryption(self.encryption.clone())
            .send()
            .await
            .map_err(|e| {
                BackendError::cloud(
                    format!("putting {}/{}", self.bucket, key),
                    aws_sdk_s3::error::DisplayErrorContext(&e),
                )
            })?;

        Ok(())
    }

    async fn fetch_network_info(&self) -> Result<NetworkInfo> {
        let mut info = NetworkInfo::default();

        let mut pages = self
            .ec2
            .describe_subnets()
            .filters(
                Filter::builder()
                    .name("vpc-id")
                    .values(&self.vpc_id)
                    .build(),
            )
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                BackendError::cloud(
                    format!("describing subnets on VPC {}", self.vpc_id),
                    aws_sdk_ec2::error::DisplayErrorContext(&e),
                )
            })?;

            for subnet in page.subnets() {
                let (Some(id), Some(cidr)) = (subnet.subnet_id(), subnet.cidr_block()) else {
                    continue;
                };
                let network: IpNet =
                    cidr.parse().map_err(|_| BackendError::Malformed {
                        what: "subnet CIDR",
                        value: cidr.to_string(),
                    })?;
                info.subnets.insert(id.to_string(), network.trunc());
            }
        }

        // The route table associated with our subnet, or the VPC main table.
        let mut tables = self
            .ec2
            .describe_route_tables()
            .filters(
                Filter::builder()
                    .name("vpc-id")
                    .values(&self.vpc_id)
                    .build(),
            )
            .filters(
                Filter::builder()
                    .name("association.subnet-id")
                    .values(&self.subnet_id)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| {
                BackendError::cloud(
                    format!("describing route table for subnet {}", self.subnet_id),
                    aws_sdk_ec2::error::DisplayErrorContext(&e),
                )
            })?;

        if tables.route_tables().is_empty() {
            tables = self
                .ec2
                .describe_route_tables()
                .filters(
                    Filter::builder()
                        .name("vpc-id")
                        .values(&self.vpc_id)
                        .build(),
                )
                .filters(
                    Filter::builder()
                        .name("association.main")
                        .values("true")
                        .build(),
                )
                .send()
                .await
                .map_err(|e| {
                    BackendError::cloud(
                        format!("describing main route table for VPC {}", self.vpc_id),
                        aws_sdk_ec2::error::DisplayErrorContext(&e),
                    )
                })?;
        }

        let Some(table) = tables.route_tables().first() else {
            return Ok(info);
        };

        for route in table.routes() {
            let Some(cidr) = route.destination_cidr_block() else {
                continue;
            };
            let parsed = || -> Result<IpNet> {
                cidr.parse::<IpNet>()
                    .map(|net| net.trunc())
                    .map_err(|_| BackendError::Malformed {
                        what: "route CIDR",
                        value: cidr.to_string(),
                    })
            };

            if let Some(peering) = route.vpc_peering_connection_id() {
                info.subnets.insert(peering.to_string(), parsed()?);
            } else if route.nat_gateway_id().is_some() {
                info.nat.push(parsed()?);
            }
        }

        Ok(info)
    }

    async fn fetch_group(&self, name: &str) -> Result<Option<Vec<String>>> {
        let mut users = Vec::new();

        let mut pages = self
            .iam
            .get_group()
            .group_name(name)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    if e.as_service_error()
                        .is_some_and(|se| se.is_no_such_entity_exception())
                    {
                        return Ok(None);
                    }
                    return Err(BackendError::cloud(
                        format!("retrieving group {name}"),
                        aws_sdk_iam::error::DisplayErrorContext(&e),
                    ));
                }
            };

            users.extend(page.users().iter().map(|u| u.user_name().to_string()));
        }

        Ok(Some(users))
    }

    async fn fetch_groups_for_user(&self, user: &str) -> Result<Option<Vec<String>>> {
        let mut groups = Vec::new();

        let mut pages = self
            .iam
            .list_groups_for_user()
            .user_name(user)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    if e.as_service_error()
                        .is_some_and(|se| se.is_no_such_entity_exception())
                    {
                        return Ok(None);
                    }
                    return Err(BackendError::cloud(
                        format!("retrieving groups for user {user}"),
                        aws_sdk_iam::error::DisplayErrorContext(&e),
                    ));
                }
            };

            groups.extend(page.groups().iter().map(|g| g.group_name().to_string()));
        }

        Ok(Some(groups))
    }

    async fn fetch_keys(&self, user: &str) -> Result<Option<Vec<String>>> {
        let mut keys = Vec::new();

        let mut pages = self
            .iam
            .list_ssh_public_keys()
            .user_name(user)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    if e.as_service_error()
                        .is_some_and(|se| se.is_no_such_entity_exception())
                    {
                        return Ok(None);
                    }
                    return Err(BackendError::cloud(
                        format!("retrieving keys for user {user}"),
                        aws_sdk_iam::error::DisplayErrorContext(&e),
                    ));
                }
            };

            keys.extend(
                page.ssh_public_keys()
                    .iter()
                    .filter(|key| *key.status() == StatusType::Active)
                    .map(|key| key.ssh_public_key_id().to_string()),
            );
        }

        Ok(Some(keys))
    }

    async fn fetch_key(&self, user: &str, alias: &str) -> Result<Option<Vec<u8>>> {
        let output = match self
            .iam
            .get_ssh_public_key()
            .user_name(user)
            .ssh_public_key_id(alias)
            .encoding(EncodingType::Pem)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .is_some_and(|se| se.is_no_such_entity_exception())
                {
                    return Ok(None);
                }
                return Err(BackendError::cloud(
                    format!("retrieving key {alias} for user {user}"),
                    aws_sdk_iam::error::DisplayErrorContext(&e),
                ));
            }
        };

        Ok(output
            .ssh_public_key()
            .map(|key| key.ssh_public_key_body().as_bytes().to_vec()))
    }

    async fn register_dns(&self, zone: &str, name: &str, weighted: bool) -> Result<()> {
        let ip = match imds_get(&self.imds, "/latest/meta-data/public-ipv4").await {
            Ok(ip) if !ip.is_empty() => ip,
            _ => {
                tracing::warn!("unable to determine public IPv4 address, not registering DNS");
                return Ok(());
            }
        };
        let ip: IpAddr = ip.parse().map_err(|_| BackendError::Malformed {
            what: "public IPv4 address",
            value: ip,
        })?;

        let set_identifier = if weighted {
            Some(imds_get(&self.imds, "/latest/meta-data/instance-id").await?)
        } else {
            None
        };

        let record = DnsRecord {
            zone: zone.to_string(),
            name: name.to_string(),
            ip,
            set_identifier,
        };

        self.change_record(ChangeAction::Upsert, &record).await?;
        tracing::info!(name, zone, %ip, "registered DNS record");

        *self.registered.lock().await = Some(record);

        Ok(())
    }

    async fn unregister_dns(&self) -> Result<()> {
        let Some(record) = self.registered.lock().await.take() else {
            return Ok(());
        };

        self.change_record(ChangeAction::Delete, &record).await?;
        tracing::info!(name = %record.name, "unregistered DNS record");

        Ok(())
    }
}

async fn imds_get(imds: &aws_config::imds::Client, path: &str) -> Result<String> {
    imds.get(path)
        .await
        .map(String::from)
        .map_err(|e| BackendError::cloud(format!("IMDS {path}"), e))
}

fn http_status<E>(
    err: &aws_sdk_s3::error::SdkError<
        E,
        aws_sdk_s3::config::http::HttpResponse,
    >,
) -> Option<u16> {
    match err {
        aws_sdk_s3::error::SdkError::ServiceError(context) => {
            Some(context.raw().status().as_u16())
        }
        _ => None,
    }
}
