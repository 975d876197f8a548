use dagger_sdk::{Container, Directory, DirectoryDockerBuildOptsBuilder, HostDirectoryOpts, Query};

use crate::{ImageBuildRequest, RegistryAuth};

/// Host checkout as a Dagger directory, without VCS metadata.
pub fn host_directory(client: &Query, source: &str) -> Directory {
    client.host().directory_opts(
        source,
        HostDirectoryOpts {
            exclude: Some(vec![".git/"]),
            include: None,
            gitignore: None,
            no_cache: None,
        },
    )
}

/// Build context for a request, with the inline Dockerfile (if any) written in place.
pub fn source_directory(client: &Query, request: &ImageBuildRequest) -> Directory {
    let source = host_directory(client, &request.source_dir.to_string_lossy());
    match &request.dockerfile_content {
        Some(content) => source.with_new_file(request.dockerfile_path.as_str(), content.as_str()),
        None => source,
    }
}

/// Image built from `dockerfile` inside the build context.
pub fn docker_build(source: Directory, dockerfile: &str) -> eyre::Result<Container> {
    let opts = DirectoryDockerBuildOptsBuilder::default()
        .dockerfile(dockerfile)
        .build()?;
    Ok(source.docker_build_opts(opts))
}

/// Attach registry credentials to the image before publishing.
pub fn with_registry_auth(client: &Query, container: Container, registry: &RegistryAuth) -> Container {
    let secret = client.set_secret("registry_password", registry.password.as_str());
    container.with_registry_auth(registry.address(), registry.username.as_str(), secret)
}
